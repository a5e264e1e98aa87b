//! Chat completion upstream call (C4).
//!
//! `POST {base}/rest/app-chat/conversations/new` — streaming line-delimited
//! JSON response, consumed by the chat stream processors (C5.1/C5.2).

use reqwest::Response;
use serde::Serialize;
use serde_json::Value;

use crate::error::UpstreamError;
use crate::headers::PayloadKind;
use crate::retry::RetryConfig;

use super::UpstreamClient;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub model_name: String,
    pub mode_name: String,
    pub messages: Value,
    pub tool_overrides: Option<Value>,
    pub model_config_override: Option<Value>,
}

impl UpstreamClient {
    /// Issues the chat completion call, returning the raw streaming response
    /// for the caller's stream processor to consume line-by-line.
    pub async fn chat_completion(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
        body: &ChatRequestBody,
    ) -> Result<Response, UpstreamError> {
        let url = format!("{}/rest/app-chat/conversations/new", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        self.execute(retry_cfg, || {
            let mut req = self.client().post(&url).json(body);
            for (name, value) in &headers {
                req = req.header(*name, value);
            }
            req
        })
        .await
    }
}
