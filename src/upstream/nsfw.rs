//! NSFW-enablement upstream calls: gRPC-Web feature-control toggle plus its
//! two JSON-POST preconditions (C4, supplemented feature §B.1).
//!
//! Grounded on `app/services/reverse/utils/grpc.py` (framing) and
//! `reverse/accept_tos.py` / `reverse/set_birth.py` (preconditions), invoked
//! by the NSFW batch worker (C6) before the gRPC-Web call.

use serde_json::json;

use crate::error::UpstreamError;
use crate::headers::PayloadKind;
use crate::retry::RetryConfig;
use crate::upstream::grpc::{encode_payload, parse_response};

use super::UpstreamClient;

/// Runs one gRPC-Web call against `url` and reduces the response to a plain
/// upstream error on any non-OK gRPC status.
async fn grpc_call(
    client: &UpstreamClient,
    retry_cfg: &RetryConfig,
    url: &str,
    headers: &[(&'static str, String)],
    payload: bytes::Bytes,
) -> Result<(), UpstreamError> {
    let response = client
        .execute(retry_cfg, || {
            let mut req = client.client().post(url).body(payload.clone());
            for (name, value) in headers {
                req = req.header(*name, value);
            }
            req
        })
        .await?;

    let body = response
        .bytes()
        .await
        .map_err(|err| UpstreamError::new(502, format!("failed to read gRPC-Web body: {err}")))?;
    let (_frames, status) = parse_response(body)
        .map_err(|err| UpstreamError::new(502, format!("failed to parse gRPC-Web body: {err}")))?;

    if status.ok() {
        Ok(())
    } else {
        Err(UpstreamError::new(status.http_equiv(), status.message.unwrap_or_default()))
    }
}

impl UpstreamClient {
    /// `POST /auth_mgmt.AuthManagement/SetTosAcceptedVersion` via gRPC-Web;
    /// precondition for NSFW enablement.
    pub async fn accept_tos(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}/auth_mgmt.AuthManagement/SetTosAcceptedVersion", self.accounts_base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::GrpcWeb);
        let payload = encode_payload(b"\x10\x01");
        grpc_call(self, retry_cfg, &url, &headers, payload).await
    }

    /// `POST /rest/auth/set-birth-date` precondition for NSFW enablement.
    pub async fn set_birth_date(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
        birth_date: &str,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}/rest/auth/set-birth-date", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        self.execute(retry_cfg, || {
            let mut req = self.client().post(&url).json(&json!({"birthDate": birth_date}));
            for (name, value) in &headers {
                req = req.header(*name, value);
            }
            req
        })
        .await?;
        Ok(())
    }

    /// `POST /auth_mgmt.AuthManagement/UpdateUserFeatureControls` via
    /// gRPC-Web framing: toggles the `always_show_nsfw_content` feature flag.
    /// Returns the mapped pseudo-HTTP status; callers treat any non-200 as
    /// an upstream error the same as a normal HTTP failure.
    pub async fn nsfw_enable(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}/auth_mgmt.AuthManagement/UpdateUserFeatureControls", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::GrpcWeb);
        let payload = encode_payload(&nsfw_feature_control_payload());
        grpc_call(self, retry_cfg, &url, &headers, payload).await
    }
}

/// Hand-assembled protobuf body for `UpdateUserFeatureControls`'s
/// `always_show_nsfw_content` flag, mirroring the original's byte-literal
/// construction (`\x0a\x02\x10\x01\x12<len><name-field>`).
fn nsfw_feature_control_payload() -> Vec<u8> {
    let name = b"always_show_nsfw_content";
    let mut inner = vec![0x0a, name.len() as u8];
    inner.extend_from_slice(name);
    let mut protobuf = vec![0x0a, 0x02, 0x10, 0x01, 0x12, inner.len() as u8];
    protobuf.extend_from_slice(&inner);
    protobuf
}
