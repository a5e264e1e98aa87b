//! Chat completions entrypoint (C9): cross-token retry loop around C4's
//! chat client, finishing into either C5's streaming or collecting
//! processor.
//!
//! Grounded on `src/agent.rs::Agent::run_turn`'s retry-then-finalize shape,
//! generalized across a token pool instead of a single collaborator.

use std::collections::HashSet;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::json;

use crate::app::AppState;
use crate::error::AppError;
use crate::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::stream::chat_collect::ChatCollectProcessor;
use crate::stream::chat_stream::ChatStreamProcessor;
use crate::stream::{idle_guarded, normalize_and_parse, CHAT_IDLE_TIMEOUT_SECS};
use crate::upstream::chat::ChatRequestBody;

use super::common::{exhausted_error, lookup_model, pick_token, upstream_to_app_error, GatewayImageResolver, TokenAttempt};

pub enum ChatOutcome {
    Collected(ChatCompletionResponse),
    Streaming(Box<dyn Stream<Item = Result<String, AppError>> + Send + Unpin>),
}

/// Runs the cross-token retry loop up to `performance.max_token_retries`,
/// returning the first successful upstream response alongside the token
/// attempt that earned it so the caller can `consume` on completion.
async fn acquire_chat_response(
    state: &AppState,
    pool_candidates: &[String],
    body: &ChatRequestBody,
) -> Result<(reqwest::Response, TokenAttempt), AppError> {
    let mut tried: HashSet<String> = HashSet::new();
    let max_retries = state.settings.performance.max_token_retries().max(1);
    let retry_cfg = state.retry_cfg.without_429();
    let dynamic_statsig = state.settings.chat.dynamic_statsig();

    let mut last_err: Option<AppError> = None;
    for _ in 0..max_retries {
        let Some(attempt) = pick_token(state, pool_candidates, &tried).await else {
            return Err(last_err.unwrap_or_else(exhausted_error));
        };
        tried.insert(attempt.token.token.clone());

        match state.upstream.chat_completion(&attempt.token.token, dynamic_statsig, &retry_cfg, body).await {
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

pub async fn chat_completions(state: AppState, request: ChatCompletionRequest) -> Result<ChatOutcome, AppError> {
    let model = lookup_model(&state, &request.model, false, false)?;
    let body = ChatRequestBody {
        model_name: model.upstream_model.clone(),
        mode_name: model.upstream_mode.clone(),
        messages: json!(request.messages),
        tool_overrides: None,
        model_config_override: None,
    };

    let (response, attempt) = acquire_chat_response(&state, &model.pool_candidates, &body).await?;
    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let filtered_tags = state.settings.chat.filter_tags();
    let show_thinking = state.settings.chat.show_thinking();
    let chat_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    if request.stream {
        let idle_timeout = Duration::from_secs(state.settings.timeout.stream_idle_timeout_secs());
        let lines = idle_guarded(Box::pin(line_stream(response)), idle_timeout);
        let resolver = GatewayImageResolver {
            state: state.clone(),
            token: attempt.token.token.clone(),
            dynamic_statsig,
            format_override: None,
        };
        let mut processor = ChatStreamProcessor::new(chat_id, model.external_id.clone(), show_thinking, filtered_tags);

        let consume_state = state.clone();
        let consume_attempt = attempt.clone();
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
                for chunk in processor.handle_event(event, &resolver).await {
                    yield Ok(sse_line(&chunk));
                }
            }
            if !failed {
                for chunk in processor.finalize() {
                    yield Ok(sse_line(&chunk));
                }
                yield Ok("data: [DONE]\n\n".to_string());
                consume_state
                    .token_pool
                    .consume(&consume_attempt.pool, &consume_attempt.token.token, cost_tier)
                    .await
                    .ok();
            }
        };

        Ok(ChatOutcome::Streaming(Box::new(Box::pin(sse))))
    } else {
        let resolver = GatewayImageResolver {
            state: state.clone(),
            token: attempt.token.token.clone(),
            dynamic_statsig,
            format_override: None,
        };
        let mut collector = ChatCollectProcessor::new(chat_id, model.external_id.clone());
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| AppError::from(anyhow::anyhow!("chat stream error: {err}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(idx) = buffer.find('\n') {
                let line = buffer[..idx].to_string();
                buffer.drain(..=idx);
                if let Some(event) = normalize_and_parse(&line) {
                    collector.handle_event(event, &resolver).await;
                }
            }
        }
        let response = collector.finish(&filtered_tags);
        state.token_pool.consume(&attempt.pool, &attempt.token.token, model.cost_tier).await.ok();
        Ok(ChatOutcome::Collected(response))
    }
}

fn sse_line(chunk: &ChatCompletionChunk) -> String {
    format!("data: {}\n\n", serde_json::to_string(chunk).unwrap_or_default())
}

/// Adapts a chunked HTTP body into a line stream. A transport error simply
/// ends the stream early; the idle-timeout guard downstream is what the
/// client-facing error path reacts to.
pub(super) fn line_stream(response: reqwest::Response) -> impl Stream<Item = String> {
    async_stream::stream! {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(idx) = buffer.find('\n') {
                let line = buffer[..idx].to_string();
                buffer.drain(..=idx);
                yield line;
            }
        }
    }
}
