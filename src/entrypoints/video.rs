//! Video generation entrypoint (C9).
//!
//! Grounded on spec.md §4.9's video specifics: a `media/post/create` call
//! precedes the chat call to obtain a `parentPostId`, the resolution/length
//! pair decides pool escalation (C8's `pool_candidates_for_model`), and an
//! `upscale`-flagged model runs the extra upscale call (C4) once the base
//! video asset resolves.

use std::collections::HashSet;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::json;

use crate::app::AppState;
use crate::error::AppError;
use crate::models::{pool_candidates_for_model, ModelDescriptor};
use crate::openai::{VideoDatum, VideoGenerationRequest, VideoGenerationResponse};
use crate::stream::video_stream::{VideoSseRecord, VideoStreamProcessor};
use crate::stream::{idle_guarded, normalize_and_parse, UpstreamEvent, VIDEO_IDLE_TIMEOUT_SECS};
use crate::upstream::chat::ChatRequestBody;

use super::chat::line_stream;
use super::common::{exhausted_error, lookup_model, pick_video_token, upstream_to_app_error, GatewayVideoResolver, TokenAttempt};

pub enum VideoOutcome {
    Collected(VideoGenerationResponse),
    Streaming(Box<dyn Stream<Item = Result<String, AppError>> + Send + Unpin>),
}

fn video_body(model: &ModelDescriptor, post_id: &str, request: &VideoGenerationRequest) -> ChatRequestBody {
    ChatRequestBody {
        model_name: model.upstream_model.clone(),
        mode_name: model.upstream_mode.clone(),
        messages: json!([{ "role": "user", "content": request.prompt }]),
        tool_overrides: Some(json!({ "parentPostId": post_id })),
        model_config_override: Some(json!({
            "aspectRatio": request.aspect_ratio,
            "videoLength": request.video_length,
            "resolutionName": request.resolution_name,
            "preset": request.preset,
        })),
    }
}

async fn acquire_video_response(
    state: &AppState,
    model: &ModelDescriptor,
    request: &VideoGenerationRequest,
) -> Result<(reqwest::Response, TokenAttempt), AppError> {
    let pool_candidates = pool_candidates_for_model(model, Some(&request.resolution_name), Some(request.video_length));
    let mut tried: HashSet<String> = HashSet::new();
    let max_retries = state.settings.performance.max_token_retries().max(1);
    let retry_cfg = state.retry_cfg.without_429();
    let dynamic_statsig = state.settings.chat.dynamic_statsig();

    let mut last_err: Option<AppError> = None;
    for _ in 0..max_retries {
        let Some(attempt) = pick_video_token(state, &request.resolution_name, request.video_length, &pool_candidates, &tried).await else {
            return Err(last_err.unwrap_or_else(exhausted_error));
        };
        tried.insert(attempt.token.token.clone());

        let post = match state.upstream.media_post_create(&attempt.token.token, dynamic_statsig, &retry_cfg).await {
            Ok(post) => post,
            Err(err) if err.status == 429 => {
                state.token_pool.mark_rate_limited(&attempt.pool, &attempt.token.token).await.ok();
                last_err = Some(upstream_to_app_error(err));
                continue;
            }
            Err(err) => {
                state
                    .token_pool
                    .record_fail(&attempt.pool, &attempt.token.token, err.status, &err.body)
                    .await
                    .ok();
                return Err(upstream_to_app_error(err));
            }
        };

        let body = video_body(model, &post.post_id, request);
        match state.upstream.chat_completion(&attempt.token.token, dynamic_statsig, &retry_cfg, &body).await {
            Ok(response) => return Ok((response, attempt)),
            Err(err) if err.status == 429 => {
                state.token_pool.mark_rate_limited(&attempt.pool, &attempt.token.token).await.ok();
                last_err = Some(upstream_to_app_error(err));
            }
            Err(err) => {
                state
                    .token_pool
                    .record_fail(&attempt.pool, &attempt.token.token, err.status, &err.body)
                    .await
                    .ok();
                return Err(upstream_to_app_error(err));
            }
        }
    }
    Err(last_err.unwrap_or_else(exhausted_error))
}

/// Runs the upscale post-processing call when the model descriptor asks for
/// it, falling back to the original URL on any failure (upscaling is a
/// quality enhancement, not a correctness requirement).
async fn maybe_upscale(state: &AppState, model: &ModelDescriptor, attempt: &TokenAttempt, dynamic_statsig: bool, raw_url: String) -> String {
    if !model.upscale {
        return raw_url;
    }
    let source_asset_id = crate::asset_cache::cache_filename(&raw_url);
    match state
        .upstream
        .video_upscale(&attempt.token.token, dynamic_statsig, &state.retry_cfg, &source_asset_id)
        .await
    {
        Ok(upscaled) => upscaled.asset_url,
        Err(_) => raw_url,
    }
}

pub async fn generate(state: AppState, request: VideoGenerationRequest) -> Result<VideoOutcome, AppError> {
    let model_id = request.model.clone().unwrap_or_else(|| "grok-video".to_string());
    let model = lookup_model(&state, &model_id, false, true)?;
    let (response, attempt) = acquire_video_response(&state, &model, &request).await?;
    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let video_format = state.settings.app.video_format();

    if request.stream {
        let resolver = GatewayVideoResolver {
            state: state.clone(),
            token: attempt.token.token.clone(),
            dynamic_statsig,
        };
        let mut processor = VideoStreamProcessor::new(&video_format);
        let idle_timeout = Duration::from_secs(state.settings.timeout.video_idle_timeout_secs());
        let lines = idle_guarded(Box::pin(line_stream(response)), idle_timeout);

        let consume_state = state.clone();
        let cost_tier = model.cost_tier;
        let model_for_upscale = model.clone();

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
                    if let Some(raw_url) = generated_image_urls.first() {
                        let final_url = maybe_upscale(&consume_state, &model_for_upscale, &attempt, dynamic_statsig, raw_url.clone()).await;
                        if let Some(record) = processor.complete(&final_url, &resolver).await {
                            yield Ok(sse_line(&record));
                        }
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

        Ok(VideoOutcome::Streaming(Box::new(Box::pin(sse))))
    } else {
        let resolver = GatewayVideoResolver {
            state: state.clone(),
            token: attempt.token.token.clone(),
            dynamic_statsig,
        };
        let mut processor = VideoStreamProcessor::new(&video_format);
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = None;
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(idx) = buffer.find('\n') {
                let line = buffer[..idx].to_string();
                buffer.drain(..=idx);
                if let Some(UpstreamEvent::ModelResponse { generated_image_urls, .. }) = normalize_and_parse(&line) {
                    if let Some(raw_url) = generated_image_urls.first() {
                        let final_url = maybe_upscale(&state, &model, &attempt, dynamic_statsig, raw_url.clone()).await;
                        if let Some(VideoSseRecord::Completed { content: rendered }) = processor.complete(&final_url, &resolver).await {
                            content = Some(rendered);
                        }
                    }
                }
            }
        }

        state.token_pool.consume(&attempt.pool, &attempt.token.token, model.cost_tier).await.ok();
        let content = content.ok_or_else(|| AppError::from(anyhow::anyhow!("upstream closed before video completed")))?;
        Ok(VideoOutcome::Collected(VideoGenerationResponse {
            created: now_secs(),
            data: vec![VideoDatum { content }],
        }))
    }
}

fn sse_line(record: &VideoSseRecord) -> String {
    format!("data: {}\n\n", serde_json::to_string(record).unwrap_or_default())
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
