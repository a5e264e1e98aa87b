//! Image edit entrypoint (C9, supplemented feature).
//!
//! Grounded on `app/services/grok/services/image_edit.py`: uploads the
//! attached images, resolves a `parentPostId` from a `media/post/create`
//! call against the first uploaded asset (falling back to the asset URL's
//! own embedded id when that call fails), then runs the same chat/stream
//! pipeline as plain image generation with an `imageEditModelConfig`
//! `model_config_override` in place of a bare text prompt.

use std::collections::HashSet;
use std::time::Duration;

use futures::{Stream, StreamExt};
use regex::Regex;
use serde_json::json;

use crate::app::AppState;
use crate::error::AppError;
use crate::openai::{ImageDatum, ImageEditRequest, ImageGenerationResponse};
use crate::stream::image_stream::{ImageSseRecord, ImageStreamProcessor};
use crate::stream::{idle_guarded, normalize_and_parse, UpstreamEvent, IMAGE_IDLE_TIMEOUT_SECS};
use crate::upstream::chat::ChatRequestBody;

use super::chat::line_stream;
use super::common::{
    exhausted_error, lookup_model, pick_token, resolve_image_format, strip_data_uri_prefix,
    upstream_to_app_error, GatewayImageResolver,
};

const MAX_IMAGES: usize = 16;
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;
const ALLOWED_CONTENT_TYPES: &[&str] = &["image/png", "image/jpeg", "image/jpg", "image/webp"];
const SENTINEL_ERROR_URL: &str = "error";

pub enum ImageEditOutcome {
    Collected(ImageGenerationResponse),
    Streaming(Box<dyn Stream<Item = Result<String, AppError>> + Send + Unpin>),
}

fn validate(request: &ImageEditRequest) -> Result<(), AppError> {
    if request.images.is_empty() {
        return Err(AppError::validation("image is required"));
    }
    if request.images.len() > MAX_IMAGES {
        return Err(AppError::validation(format!("too many images; maximum is {MAX_IMAGES}")));
    }
    for image in &request.images {
        if image.bytes.len() > MAX_IMAGE_BYTES {
            return Err(AppError::validation("image exceeds the 50MB size limit"));
        }
        if !ALLOWED_CONTENT_TYPES.contains(&image.content_type.as_str()) {
            return Err(AppError::validation(format!(
                "unsupported image content type \"{}\"; expected png, jpg, or webp",
                image.content_type
            )));
        }
    }
    Ok(())
}

/// Extracts a fallback post id embedded in an asset URL's own path, used
/// when `media_post_create` doesn't return one.
fn post_id_from_url(url: &str) -> Option<String> {
    if let Ok(re) = Regex::new(r"/generated/([a-f0-9-]+)/") {
        if let Some(caps) = re.captures(url) {
            return caps.get(1).map(|m| m.as_str().to_string());
        }
    }
    if let Ok(re) = Regex::new(r"/users/[^/]+/([a-f0-9-]+)/content") {
        if let Some(caps) = re.captures(url) {
            return caps.get(1).map(|m| m.as_str().to_string());
        }
    }
    None
}

fn edit_body(model: &crate::models::ModelDescriptor, prompt: &str, image_urls: &[String], parent_post_id: &str) -> ChatRequestBody {
    let mut model_config_override = json!({
        "modelMap": {
            "imageEditModel": "imagine",
            "imageEditModelConfig": {
                "imageReferences": image_urls,
            },
        }
    });
    if !parent_post_id.is_empty() {
        model_config_override["modelMap"]["imageEditModelConfig"]["parentPostId"] = json!(parent_post_id);
    }
    ChatRequestBody {
        model_name: model.upstream_model.clone(),
        mode_name: model.upstream_mode.clone(),
        messages: json!([{ "role": "user", "content": prompt }]),
        tool_overrides: Some(json!({ "imageGen": true })),
        model_config_override: Some(model_config_override),
    }
}

async fn upload_images(
    state: &AppState,
    token: &str,
    dynamic_statsig: bool,
    retry_cfg: &crate::retry::RetryConfig,
    request: &ImageEditRequest,
) -> Result<Vec<String>, AppError> {
    let mut image_urls = Vec::with_capacity(request.images.len());
    for image in &request.images {
        let uploaded = state
            .upstream
            .upload_file(token, dynamic_statsig, retry_cfg, &image.bytes, &image.content_type)
            .await
            .map_err(upstream_to_app_error)?;
        let uri = uploaded.file_uri;
        if uri.starts_with("http") {
            image_urls.push(uri);
        } else {
            image_urls.push(format!("{}/{}", state.upstream.asset_base_url, uri.trim_start_matches('/')));
        }
    }
    if image_urls.is_empty() {
        return Err(AppError::from(anyhow::anyhow!("image upload failed")));
    }
    Ok(image_urls)
}

async fn resolve_parent_post_id(
    state: &AppState,
    token: &str,
    dynamic_statsig: bool,
    retry_cfg: &crate::retry::RetryConfig,
    image_urls: &[String],
) -> String {
    if let Ok(post) = state.upstream.media_post_create(token, dynamic_statsig, retry_cfg).await {
        return post.post_id;
    }
    for url in image_urls {
        if let Some(id) = post_id_from_url(url) {
            return id;
        }
    }
    String::new()
}

pub async fn edit(state: AppState, request: ImageEditRequest) -> Result<ImageEditOutcome, AppError> {
    validate(&request)?;
    let model_id = request.model.clone().unwrap_or_else(|| "grok-image".to_string());
    let model = lookup_model(&state, &model_id, true, false)?;
    let n = request.n.max(1);
    let format = resolve_image_format(&state, request.response_format.as_deref())?;

    if request.stream && n > 2 {
        return Err(AppError::validation("streaming image generation supports n of 1 or 2"));
    }

    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let retry_cfg = state.retry_cfg.without_429();
    let max_retries = state.settings.performance.max_token_retries().max(1);

    let mut tried: HashSet<String> = HashSet::new();
    let mut picked = None;
    let mut last_err = None;
    for _ in 0..max_retries {
        let Some(candidate) = pick_token(&state, &model.pool_candidates, &tried).await else {
            return Err(last_err.unwrap_or_else(exhausted_error));
        };
        tried.insert(candidate.token.token.clone());

        let image_urls = match upload_images(&state, &candidate.token.token, dynamic_statsig, &retry_cfg, &request).await {
            Ok(urls) => urls,
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        };
        let parent_post_id = resolve_parent_post_id(&state, &candidate.token.token, dynamic_statsig, &retry_cfg, &image_urls).await;
        let body = edit_body(&model, &request.prompt, &image_urls, &parent_post_id);

        match state.upstream.chat_completion(&candidate.token.token, dynamic_statsig, &retry_cfg, &body).await {
            Ok(resp) => {
                picked = Some((resp, candidate));
                break;
            }
            Err(err) if err.status == 429 => {
                state.token_pool.mark_rate_limited(&candidate.pool, &candidate.token.token).await.ok();
                last_err = Some(upstream_to_app_error(err));
            }
            Err(err) => {
                state
                    .token_pool
                    .record_fail(&candidate.pool, &candidate.token.token, err.status, &err.body)
                    .await
                    .ok();
                return Err(upstream_to_app_error(err));
            }
        }
    }
    let (response, attempt) = picked.ok_or_else(|| last_err.unwrap_or_else(exhausted_error))?;

    let resolver = GatewayImageResolver {
        state: state.clone(),
        token: attempt.token.token.clone(),
        dynamic_statsig,
        format_override: Some(format.clone()),
    };

    if request.stream {
        let mut processor = ImageStreamProcessor::new(n);
        let idle_timeout = Duration::from_secs(IMAGE_IDLE_TIMEOUT_SECS);
        let lines = idle_guarded(Box::pin(line_stream(response)), idle_timeout);
        let consume_state = state.clone();
        let cost_tier = model.cost_tier;

        let sse = async_stream::stream! {
            tokio::pin!(lines);
            let mut failed = false;
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        failed = true;
                        yield Err(AppError::from(err));
                        break;
                    }
                };
                let Some(event) = normalize_and_parse(&line) else { continue };
                if let Some(record) = processor.handle_event(&event) {
                    yield Ok(sse_line(&record));
                }
                if let UpstreamEvent::ModelResponse { generated_image_urls, .. } = &event {
                    for record in processor.handle_model_response(generated_image_urls, &resolver).await {
                        yield Ok(sse_line(&record));
                    }
                }
            }
            if !failed {
                consume_state
                    .token_pool
                    .consume(&attempt.pool, &attempt.token.token, cost_tier)
                    .await
                    .ok();
            }
        };

        return Ok(ImageEditOutcome::Streaming(Box::new(Box::pin(sse))));
    }

    let mut urls = Vec::new();
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(idx) = buffer.find('\n') {
            let line = buffer[..idx].to_string();
            buffer.drain(..=idx);
            if let Some(UpstreamEvent::ModelResponse { generated_image_urls, .. }) = normalize_and_parse(&line) {
                for url in generated_image_urls {
                    urls.push(resolver.resolve(&url).await);
                }
            }
        }
    }

    state.token_pool.consume(&attempt.pool, &attempt.token.token, model.cost_tier).await.ok();

    let mut data = Vec::with_capacity(n as usize);
    for i in 0..n as usize {
        data.push(match urls.get(i) {
            Some(url) if format == "b64_json" => {
                ImageDatum { url: None, b64_json: Some(strip_data_uri_prefix(url)) }
            }
            Some(url) => ImageDatum { url: Some(url.clone()), b64_json: None },
            None => ImageDatum { url: Some(SENTINEL_ERROR_URL.to_string()), b64_json: None },
        });
    }

    Ok(ImageEditOutcome::Collected(ImageGenerationResponse {
        created: now_secs(),
        data,
    }))
}

fn sse_line(record: &ImageSseRecord) -> String {
    format!("data: {}\n\n", serde_json::to_string(record).unwrap_or_default())
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn extracts_post_id_from_generated_path() {
        let id = post_id_from_url("https://assets.grok.com/generated/ab12-cd34/full.jpg").unwrap();
        assert_eq!(id, "ab12-cd34");
    }

    #[test]
    fn extracts_post_id_from_users_content_path() {
        let id = post_id_from_url("https://assets.grok.com/users/u1/ab12-cd34/content").unwrap();
        assert_eq!(id, "ab12-cd34");
    }

    #[test]
    fn returns_none_when_no_pattern_matches() {
        assert!(post_id_from_url("https://assets.grok.com/misc/file.jpg").is_none());
    }

    #[test]
    fn rejects_too_many_images() {
        let request = ImageEditRequest {
            prompt: "edit".into(),
            model: None,
            images: (0..17)
                .map(|_| crate::openai::UploadedImage {
                    bytes: vec![0u8; 4],
                    content_type: "image/png".into(),
                })
                .collect(),
            n: 1,
            response_format: None,
            stream: false,
        };
        assert!(validate(&request).is_err());
    }

    #[test]
    fn rejects_unsupported_content_type() {
        let request = ImageEditRequest {
            prompt: "edit".into(),
            model: None,
            images: vec![crate::openai::UploadedImage {
                bytes: vec![0u8; 4],
                content_type: "image/gif".into(),
            }],
            n: 1,
            response_format: None,
            stream: false,
        };
        assert!(validate(&request).is_err());
    }
}
