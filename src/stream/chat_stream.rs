//! Chat stream processor (C5.1): upstream JSON lines → OpenAI SSE deltas.
//!
//! Grounded on spec.md §4.5.1. Image URLs inside a `modelResponse` are
//! resolved through the [`ImageUrlResolver`] trait so this module stays free
//! of asset-cache/HTTP concerns; the gateway layer supplies the resolver
//! backed by C7.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::openai::{ChatChunkChoice, ChatCompletionChunk, ChatDelta};

use super::filter::TagFilter;
use super::UpstreamEvent;

#[async_trait]
pub trait ImageUrlResolver: Send + Sync {
    /// Resolves one upstream image URL into markdown/HTML content to splice
    /// into the assistant's text (a rewritten gateway URL, a data URI, or
    /// the raw upstream URL, per config).
    async fn resolve(&self, upstream_url: &str) -> String;
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct ChatStreamProcessor {
    chat_id: String,
    model: String,
    created: u64,
    tag_filter: TagFilter,
    think_open: bool,
    show_thinking: bool,
    role_sent: bool,
    response_id: Option<String>,
    model_hash: Option<String>,
}

impl ChatStreamProcessor {
    pub fn new(chat_id: String, model: String, show_thinking: bool, filtered_tags: HashSet<String>) -> Self {
        Self {
            chat_id,
            model,
            created: now_secs(),
            tag_filter: TagFilter::new(filtered_tags),
            think_open: false,
            show_thinking,
            role_sent: false,
            response_id: None,
            model_hash: None,
        }
    }

    fn chunk(&self, content: Option<String>, finish_reason: Option<&'static str>, role: Option<&'static str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.chat_id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta: ChatDelta { role, content },
                finish_reason,
            }],
        }
    }

    fn initial_role_chunk(&mut self) -> Option<ChatCompletionChunk> {
        if self.role_sent {
            return None;
        }
        self.role_sent = true;
        Some(self.chunk(None, None, Some("assistant")))
    }

    /// Handles one classified upstream event, returning zero or more chunks
    /// to emit immediately (not including the initial role chunk, which the
    /// caller requests once via [`Self::initial_role_chunk`]).
    pub async fn handle_event(
        &mut self,
        event: UpstreamEvent,
        image_resolver: &dyn ImageUrlResolver,
    ) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();
        if let Some(role_chunk) = self.initial_role_chunk() {
            out.push(role_chunk);
        }

        match event {
            UpstreamEvent::Token { token } => {
                let filtered = self.tag_filter.push(&token);
                if !filtered.is_empty() {
                    out.push(self.chunk(Some(filtered), None, None));
                }
            }
            UpstreamEvent::StreamingImageGenerationResponse { progress, .. } => {
                if self.show_thinking {
                    let mut text = String::new();
                    if !self.think_open {
                        text.push_str("<think>");
                        self.think_open = true;
                    }
                    text.push_str(&format!("generating image... {progress}%\n"));
                    out.push(self.chunk(Some(text), None, None));
                }
            }
            UpstreamEvent::ModelResponse {
                response_id,
                model_hash,
                message,
                generated_image_urls,
            } => {
                self.response_id = response_id.or(self.response_id.take());
                self.model_hash = model_hash.or(self.model_hash.take());
                let mut text = String::new();
                if let Some(message) = message {
                    let filtered = self.tag_filter.push(&message);
                    text.push_str(&filtered);
                }
                for url in generated_image_urls {
                    let resolved = image_resolver.resolve(&url).await;
                    text.push_str(&format!("\n![generated image]({resolved})"));
                }
                if !text.is_empty() {
                    out.push(self.chunk(Some(text), None, None));
                }
            }
            UpstreamEvent::StreamingVideoGenerationResponse { .. } | UpstreamEvent::Unknown(_) => {}
        }

        out
    }

    /// Closes any open `<think>` block and emits the terminal
    /// `finish_reason="stop"` chunk. The caller appends the literal
    /// `data: [DONE]\n\n` line after this.
    pub fn finalize(&mut self) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();
        let trailing = self.tag_filter.finish();
        let mut closing_text = trailing;
        if self.think_open {
            closing_text.push_str("</think>");
            self.think_open = false;
        }
        if !closing_text.is_empty() {
            out.push(self.chunk(Some(closing_text), None, None));
        }
        out.push(self.chunk(None, Some("stop"), None));
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::stream::filter::default_filtered_tags;

    struct NoopResolver;
    #[async_trait]
    impl ImageUrlResolver for NoopResolver {
        async fn resolve(&self, upstream_url: &str) -> String {
            upstream_url.to_string()
        }
    }

    #[tokio::test]
    async fn first_event_carries_role_then_content() {
        let mut processor = ChatStreamProcessor::new("c1".into(), "grok-4-fast".into(), false, default_filtered_tags());
        let chunks = processor
            .handle_event(UpstreamEvent::Token { token: "hi".into() }, &NoopResolver)
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.role, Some("assistant"));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn filtered_tag_content_is_elided_across_events() {
        let mut processor = ChatStreamProcessor::new("c1".into(), "grok-4-fast".into(), false, default_filtered_tags());
        let _ = processor
            .handle_event(UpstreamEvent::Token { token: "<grok:render>".into() }, &NoopResolver)
            .await;
        let chunks = processor
            .handle_event(UpstreamEvent::Token { token: "hidden</grok:render>visible".into() }, &NoopResolver)
            .await;
        let content: String = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect();
        assert_eq!(content, "visible");
    }

    #[tokio::test]
    async fn finalize_emits_stop_finish_reason() {
        let mut processor = ChatStreamProcessor::new("c1".into(), "grok-4-fast".into(), false, default_filtered_tags());
        let chunks = processor.finalize();
        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason, Some("stop"));
    }
}
