//! Image generation entrypoint (C9).
//!
//! Grounded on spec.md §4.9's image-specific fan-out note: the upstream
//! chat-image call only ever returns (at most) two candidates per request,
//! so a non-streaming request for `n` images issues `ceil(n/2)` independent
//! subrequests concurrently, each running its own cross-token retry loop,
//! and pads any shortfall with an error sentinel rather than under-counting
//! silently.

use std::collections::HashSet;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::json;

use crate::app::AppState;
use crate::error::AppError;
use crate::openai::{ImageDatum, ImageGenerationRequest, ImageGenerationResponse};
use crate::stream::image_stream::{ImageSseRecord, ImageStreamProcessor};
use crate::stream::{idle_guarded, normalize_and_parse, UpstreamEvent, IMAGE_IDLE_TIMEOUT_SECS};
use crate::upstream::chat::ChatRequestBody;

use super::chat::line_stream;
use super::common::{
    exhausted_error, lookup_model, pick_token, resolve_image_format, strip_data_uri_prefix,
    upstream_to_app_error, GatewayImageResolver,
};

const SENTINEL_ERROR_URL: &str = "error";

pub enum ImageOutcome {
    Collected(ImageGenerationResponse),
    Streaming(Box<dyn Stream<Item = Result<String, AppError>> + Send + Unpin>),
}

fn image_body(model: &crate::models::ModelDescriptor, prompt: &str) -> ChatRequestBody {
    ChatRequestBody {
        model_name: model.upstream_model.clone(),
        mode_name: model.upstream_mode.clone(),
        messages: json!([{ "role": "user", "content": prompt }]),
        tool_overrides: None,
        model_config_override: None,
    }
}

pub async fn generate(state: AppState, request: ImageGenerationRequest) -> Result<ImageOutcome, AppError> {
    let model_id = request.model.clone().unwrap_or_else(|| "grok-image".to_string());
    let model = lookup_model(&state, &model_id, true, false)?;
    let n = request.n.max(1);
    let format = resolve_image_format(&state, request.response_format.as_deref())?;

    if request.stream {
        if n > 2 {
            return Err(AppError::validation("streaming image generation supports n of 1 or 2"));
        }
        return stream_one(state, model, &request.prompt, n, format).await;
    }

    let subrequests = n.div_ceil(2);
    let mut tasks = Vec::with_capacity(subrequests as usize);
    for _ in 0..subrequests {
        let state = state.clone();
        let model = model.clone();
        let prompt = request.prompt.clone();
        let format = format.clone();
        tasks.push(tokio::spawn(async move { collect_one(state, model, &prompt, format).await }));
    }

    let mut urls = Vec::new();
    for task in tasks {
        match task.await {
            Ok(Ok(mut batch)) => urls.append(&mut batch),
            Ok(Err(_)) | Err(_) => {}
        }
    }

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

    Ok(ImageOutcome::Collected(ImageGenerationResponse {
        created: now_secs(),
        data,
    }))
}

async fn collect_one(
    state: AppState,
    model: crate::models::ModelDescriptor,
    prompt: &str,
    format: String,
) -> Result<Vec<String>, AppError> {
    let body = image_body(&model, prompt);
    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let retry_cfg = state.retry_cfg.without_429();
    let max_retries = state.settings.performance.max_token_retries().max(1);

    let mut tried: HashSet<String> = HashSet::new();
    let mut response = None;
    let mut attempt = None;
    let mut last_err = None;
    for _ in 0..max_retries {
        let Some(candidate) = pick_token(&state, &model.pool_candidates, &tried).await else {
            return Err(last_err.unwrap_or_else(exhausted_error));
        };
        tried.insert(candidate.token.token.clone());
        match state.upstream.chat_completion(&candidate.token.token, dynamic_statsig, &retry_cfg, &body).await {
            Ok(resp) => {
                response = Some(resp);
                attempt = Some(candidate);
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
    let (response, attempt) = match (response, attempt) {
        (Some(r), Some(a)) => (r, a),
        _ => return Err(last_err.unwrap_or_else(exhausted_error)),
    };

    let resolver = GatewayImageResolver {
        state: state.clone(),
        token: attempt.token.token.clone(),
        dynamic_statsig,
        format_override: Some(format),
    };

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
    Ok(urls)
}

async fn stream_one(
    state: AppState,
    model: crate::models::ModelDescriptor,
    prompt: &str,
    n: u32,
    format: String,
) -> Result<ImageOutcome, AppError> {
    let body = image_body(&model, prompt);
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
        format_override: Some(format),
    };
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

    Ok(ImageOutcome::Streaming(Box::new(Box::pin(sse))))
}

fn sse_line(record: &ImageSseRecord) -> String {
    format!("data: {}\n\n", serde_json::to_string(record).unwrap_or_default())
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
