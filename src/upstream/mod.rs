//! Upstream Reverse Clients (C4): one stateless builder per upstream
//! endpoint, sharing a common HTTP client, header builder, and retry wrapper.
//!
//! Grounded on `src/llm.rs` (`LlmClient`: a `reqwest::Client` wrapper with one
//! method per upstream call, Bearer-style auth header, JSON (de)serialization)
//! generalized from a single chat endpoint to the full endpoint set named in
//! spec.md §4.4, plus gRPC-Web framing (`grpc.rs`) for the NSFW path.

pub mod assets;
pub mod chat;
pub mod grpc;
pub mod image_ws;
pub mod media;
pub mod nsfw;
pub mod proxy_pool;
pub mod video;
pub mod voice;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Response;

use crate::config::{NetworkSettings, SecuritySettings};
use crate::error::UpstreamError;
use crate::headers::{build_headers, PayloadKind};
use crate::retry::{retry_on_status, RetryConfig};
use crate::upstream::proxy_pool::ProxyPool;

/// Shared collaborator for every C4 endpoint client.
pub struct UpstreamClient {
    direct_client: reqwest::Client,
    proxy_clients: HashMap<String, reqwest::Client>,
    pub base_url: String,
    pub asset_base_url: String,
    pub accounts_base_url: String,
    pub security: SecuritySettings,
    pub proxy_pool: Arc<ProxyPool>,
}

impl UpstreamClient {
    pub fn new(network: &NetworkSettings, security: &SecuritySettings, proxy_pool: Arc<ProxyPool>) -> anyhow::Result<Self> {
        let build = |proxy: Option<&str>| -> anyhow::Result<reqwest::Client> {
            let mut builder = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(network.connect_timeout_secs()))
                .timeout(Duration::from_secs(network.timeout_secs()));
            if let Some(proxy_url) = proxy {
                builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
            }
            Ok(builder.build()?)
        };

        let direct_client = build(None)?;
        let mut proxy_clients = HashMap::new();
        for proxy_url in network.proxies.iter().flatten() {
            proxy_clients.insert(proxy_url.clone(), build(Some(proxy_url))?);
        }

        Ok(Self {
            direct_client,
            proxy_clients,
            base_url: network.base_proxy_url(),
            asset_base_url: network.asset_proxy_url(),
            accounts_base_url: network.accounts_proxy_url(),
            security: security.clone(),
            proxy_pool,
        })
    }

    /// Next client in the outbound proxy rotation (direct connection if the
    /// pool is empty, per spec.md §4.4 / supplemented feature §B.3).
    pub fn client(&self) -> &reqwest::Client {
        match self.proxy_pool.next() {
            Some(proxy_url) => self.proxy_clients.get(proxy_url).unwrap_or(&self.direct_client),
            None => &self.direct_client,
        }
    }

    /// Builds the header vector for one request against `token`.
    pub fn headers_for(&self, token: &str, dynamic_statsig: bool, payload_kind: PayloadKind) -> Vec<(&'static str, String)> {
        build_headers(token, &self.security, dynamic_statsig, payload_kind).headers
    }

    /// Executes `request` under the retry engine, classifying non-2xx
    /// responses into [`UpstreamError`].
    pub async fn execute(
        &self,
        retry_cfg: &RetryConfig,
        mut build_request: impl FnMut() -> reqwest::RequestBuilder,
    ) -> Result<Response, UpstreamError> {
        retry_on_status(retry_cfg, || async {
            let request = build_request();
            let response = request.send().await.map_err(|err| {
                UpstreamError::new(502, format!("transport error: {err}"))
            })?;
            if response.status().is_success() {
                return Ok(response);
            }
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            Err(UpstreamError::new(status, body).with_retry_after(retry_after))
        })
        .await
    }
}
