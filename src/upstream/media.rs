//! Media-post-create and rate-limits-probe upstream calls (C4).

use serde::Deserialize;
use serde_json::json;

use crate::error::UpstreamError;
use crate::headers::PayloadKind;
use crate::retry::RetryConfig;

use super::UpstreamClient;

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPost {
    #[serde(rename = "postId")]
    pub post_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitProbe {
    #[serde(rename = "remainingQueries")]
    pub remaining_queries: u32,
    #[serde(rename = "waitTimeSeconds")]
    pub wait_time_seconds: Option<u64>,
}

impl UpstreamClient {
    /// Precedes a video chat call to obtain `parentPostId`.
    pub async fn media_post_create(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
    ) -> Result<MediaPost, UpstreamError> {
        let url = format!("{}/rest/media/post/create", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        let response = self
            .execute(retry_cfg, || {
                let mut req = self.client().post(&url).json(&json!({}));
                for (name, value) in &headers {
                    req = req.header(*name, value);
                }
                req
            })
            .await?;
        response
            .json()
            .await
            .map_err(|err| UpstreamError::new(502, format!("failed to parse media post response: {err}")))
    }

    pub async fn rate_limits_probe(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
        request_kind: &str,
        model_name: &str,
    ) -> Result<RateLimitProbe, UpstreamError> {
        let url = format!("{}/rest/rate-limits", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        let body = json!({ "requestKind": request_kind, "modelName": model_name });
        let response = self
            .execute(retry_cfg, || {
                let mut req = self.client().post(&url).json(&body);
                for (name, value) in &headers {
                    req = req.header(*name, value);
                }
                req
            })
            .await?;
        response
            .json()
            .await
            .map_err(|err| UpstreamError::new(502, format!("failed to parse rate-limit probe response: {err}")))
    }
}
