//! Video upscale post-processing call (C4, supplemented feature §B.2).
//!
//! Grounded on `reverse/video_upscale.py`; invoked by the video entrypoint
//! (C9) when the model descriptor's `upscale` flag is set.

use serde::Deserialize;
use serde_json::json;

use crate::error::UpstreamError;
use crate::headers::PayloadKind;
use crate::retry::RetryConfig;

use super::UpstreamClient;

#[derive(Debug, Clone, Deserialize)]
pub struct UpscaledVideo {
    #[serde(rename = "assetUrl")]
    pub asset_url: String,
}

impl UpstreamClient {
    pub async fn video_upscale(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
        source_asset_id: &str,
    ) -> Result<UpscaledVideo, UpstreamError> {
        let url = format!("{}/rest/media/video/upscale", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        let body = json!({ "assetId": source_asset_id });
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
            .map_err(|err| UpstreamError::new(502, format!("failed to parse video upscale response: {err}")))
    }
}
