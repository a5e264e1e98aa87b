//! Stream Processors (C5): shared scaffolding for consuming an upstream
//! line-delimited JSON response and emitting a client-facing SSE stream or
//! collected result.
//!
//! Grounded on `app/services/reverse/ws_imagine.py`'s idle-timeout pattern
//! (generalized from the WS-specific case to every streamed upstream call)
//! and spec.md §9's "from dynamic typing to tagged variants" design note:
//! upstream lines are heterogeneous dicts in the original; here they are
//! parsed into an explicit [`UpstreamEvent`] discriminated by which sub-keys
//! are present under `result.response`, never carried around as open maps.

pub mod chat_collect;
pub mod chat_stream;
pub mod filter;
pub mod image_stream;
pub mod image_ws_processor;
pub mod video_stream;

use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio_stream::StreamExt as TokioStreamExt;

use crate::error::StreamIdleTimeout;

/// Idle-timeout defaults per mode (spec.md §4.5).
pub const CHAT_IDLE_TIMEOUT_SECS: u64 = 45;
pub const IMAGE_IDLE_TIMEOUT_SECS: u64 = 45;
pub const VIDEO_IDLE_TIMEOUT_SECS: u64 = 90;

/// One upstream stream line, tagged by which `result.response` sub-key is
/// present, rather than passed around as a raw JSON map.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Token {
        token: String,
    },
    StreamingImageGenerationResponse {
        image_index: u32,
        progress: u32,
    },
    ModelResponse {
        response_id: Option<String>,
        model_hash: Option<String>,
        message: Option<String>,
        generated_image_urls: Vec<String>,
    },
    StreamingVideoGenerationResponse {
        progress: u32,
    },
    Unknown(Value),
}

/// Trims a raw line, strips the `data:` SSE-style prefix, and classifies it.
/// Returns `None` for lines that carry no event (`[DONE]`, empty lines).
pub fn normalize_and_parse(raw_line: &str) -> Option<UpstreamEvent> {
    let trimmed = raw_line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let payload = trimmed.strip_prefix("data:").map(str::trim).unwrap_or(trimmed);
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    Some(classify(&value))
}

fn classify(value: &Value) -> UpstreamEvent {
    let response = value.pointer("/result/response").unwrap_or(value);

    if let Some(streaming) = response.get("streamingImageGenerationResponse") {
        return UpstreamEvent::StreamingImageGenerationResponse {
            image_index: streaming.get("imageIndex").and_then(Value::as_u64).unwrap_or(0) as u32,
            progress: streaming.get("progress").and_then(Value::as_u64).unwrap_or(0) as u32,
        };
    }
    if let Some(streaming) = response.get("streamingVideoGenerationResponse") {
        return UpstreamEvent::StreamingVideoGenerationResponse {
            progress: streaming.get("progress").and_then(Value::as_u64).unwrap_or(0) as u32,
        };
    }
    if let Some(model_response) = response.get("modelResponse") {
        let generated_image_urls = model_response
            .get("generatedImageUrls")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        return UpstreamEvent::ModelResponse {
            response_id: response.get("responseId").and_then(Value::as_str).map(String::from),
            model_hash: response
                .pointer("/llmInfo/modelHash")
                .and_then(Value::as_str)
                .map(String::from),
            message: model_response.get("message").and_then(Value::as_str).map(String::from),
            generated_image_urls,
        };
    }
    if let Some(token) = response.get("token").and_then(Value::as_str) {
        return UpstreamEvent::Token {
            token: token.to_string(),
        };
    }
    UpstreamEvent::Unknown(value.clone())
}

enum IdleGuardState<S> {
    Running(S),
    Done,
}

/// Wraps a line stream with an idle-timeout guard: if no item arrives within
/// `idle_timeout`, yields one [`StreamIdleTimeout`] error and ends the
/// stream (the caller converts this into an `upstream_error`/504).
pub fn idle_guarded<S>(
    inner: S,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<String, StreamIdleTimeout>>
where
    S: Stream<Item = String> + Unpin,
{
    futures::stream::unfold(IdleGuardState::Running(inner), move |state| async move {
        let IdleGuardState::Running(mut inner) = state else {
            return None;
        };
        match tokio::time::timeout(idle_timeout, TokioStreamExt::next(&mut inner)).await {
            Ok(Some(line)) => Some((Ok(line), IdleGuardState::Running(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(StreamIdleTimeout {
                    idle_secs: idle_timeout.as_secs(),
                }),
                IdleGuardState::Done,
            )),
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn strips_data_prefix_and_skips_done() {
        assert!(normalize_and_parse("data: [DONE]").is_none());
        assert!(normalize_and_parse("").is_none());
        assert!(normalize_and_parse("   ").is_none());
    }

    #[test]
    fn classifies_token_event() {
        let line = r#"{"result":{"response":{"token":"hello"}}}"#;
        match normalize_and_parse(line).unwrap() {
            UpstreamEvent::Token { token } => assert_eq!(token, "hello"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn classifies_model_response_event() {
        let line = r#"{"result":{"response":{"responseId":"r1","llmInfo":{"modelHash":"h1"},"modelResponse":{"message":"hi","generatedImageUrls":["https://x/a.jpg"]}}}}"#;
        match normalize_and_parse(line).unwrap() {
            UpstreamEvent::ModelResponse {
                response_id,
                model_hash,
                message,
                generated_image_urls,
            } => {
                assert_eq!(response_id.as_deref(), Some("r1"));
                assert_eq!(model_hash.as_deref(), Some("h1"));
                assert_eq!(message.as_deref(), Some("hi"));
                assert_eq!(generated_image_urls.len(), 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
