//! Asset upload/list/delete/download upstream calls (C4).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use reqwest::Response;
use serde::Deserialize;
use serde_json::json;

use crate::error::UpstreamError;
use crate::headers::PayloadKind;
use crate::retry::RetryConfig;

use super::UpstreamClient;

#[derive(Debug, Clone, Deserialize)]
pub struct UploadedAsset {
    #[serde(rename = "fileMetadataId")]
    pub file_metadata_id: String,
    #[serde(rename = "fileUri")]
    pub file_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetListPage {
    pub assets: Vec<AssetListItem>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetListItem {
    pub id: String,
    pub uri: Option<String>,
}

impl UpstreamClient {
    pub async fn upload_file(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<UploadedAsset, UpstreamError> {
        let url = format!("{}/rest/app-chat/upload-file", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        let encoded = BASE64.encode(bytes);
        let body = json!({ "content": encoded, "mimeType": mime_type });

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
            .json::<UploadedAsset>()
            .await
            .map_err(|err| UpstreamError::new(502, format!("failed to parse upload response: {err}")))
    }

    /// Iterates pages until `nextPageToken` is absent or repeats, to guard
    /// against a misbehaving upstream looping forever.
    pub async fn list_assets(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
    ) -> Result<Vec<AssetListItem>, UpstreamError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!("{}/rest/assets", self.base_url);
            if let Some(ref tok) = page_token {
                url.push_str(&format!("?pageToken={tok}"));
            }
            let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
            let response = self
                .execute(retry_cfg, || {
                    let mut req = self.client().get(&url);
                    for (name, value) in &headers {
                        req = req.header(*name, value);
                    }
                    req
                })
                .await?;
            let page: AssetListPage = response
                .json()
                .await
                .map_err(|err| UpstreamError::new(502, format!("failed to parse asset list page: {err}")))?;
            items.extend(page.assets);
            match page.next_page_token {
                Some(next) if Some(&next) != page_token.as_ref() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    pub async fn delete_asset(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
        asset_id: &str,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}/rest/assets/{asset_id}", self.base_url);
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        self.execute(retry_cfg, || {
            let mut req = self.client().delete(&url);
            for (name, value) in &headers {
                req = req.header(*name, value);
            }
            req
        })
        .await?;
        Ok(())
    }

    /// Streams the asset body to `dest_path`, returning the raw response for
    /// callers that want to inspect headers (content-type) first.
    pub async fn download_asset_to(
        &self,
        token: &str,
        dynamic_statsig: bool,
        retry_cfg: &RetryConfig,
        asset_path: &str,
        dest_path: &std::path::Path,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}/{}", self.asset_base_url, asset_path.trim_start_matches('/'));
        let headers = self.headers_for(token, dynamic_statsig, PayloadKind::Json);
        let response: Response = self
            .execute(retry_cfg, || {
                let mut req = self.client().get(&url);
                for (name, value) in &headers {
                    req = req.header(*name, value);
                }
                req
            })
            .await?;

        let mut file = tokio::fs::File::create(dest_path)
            .await
            .map_err(|err| UpstreamError::new(500, format!("failed to create cache file: {err}")))?;
        let mut stream = response.bytes_stream();
        use tokio::io::AsyncWriteExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| UpstreamError::new(502, format!("asset stream error: {err}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|err| UpstreamError::new(500, format!("failed to write cache file: {err}")))?;
        }
        Ok(())
    }
}
