//! LiveKit voice-mode token brokering (C4).
//!
//! The gateway only brokers the access token; relaying the WebSocket session
//! to LiveKit itself is out of scope (spec.md §1 Out-of-scope).

use serde::Deserialize;

use crate::error::UpstreamError;
use crate::headers::PayloadKind;
use crate::retry::RetryConfig;

use super::UpstreamClient;

#[derive(Debug, Clone, Deserialize)]
pub struct LiveKitToken {
    pub token: String,
}

impl UpstreamClient {
    pub async fn livekit_token(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
    ) -> Result<LiveKitToken, UpstreamError> {
        let url = format!("{}/rest/livekit/tokens", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        let response = self
            .execute(retry_cfg, || {
                let mut req = self.client().post(&url).json(&serde_json::json!({}));
                for (name, value) in &headers {
                    req = req.header(*name, value);
                }
                req
            })
            .await?;
        response
            .json()
            .await
            .map_err(|err| UpstreamError::new(502, format!("failed to parse livekit token response: {err}")))
    }
}
