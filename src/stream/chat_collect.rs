//! Chat collect processor (C5.2): accumulates a full non-streaming
//! `chat.completion` response, then strips filtered-tag blocks with a final
//! regex sweep (grounded on spec.md §4.5.2 — unlike the streaming variant,
//! the non-streaming path has the whole text available at once, so a single
//! sweep is equivalent to the incremental state machine and is idempotent
//! by construction: running it twice on already-stripped text is a no-op).

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use crate::openai::{ChatChoice, ChatCompletionResponse, ChatMessageOut};

use super::chat_stream::ImageUrlResolver;
use super::UpstreamEvent;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Strips every `<tag ...>...</tag>` block (and self-closing `<tag .../>`
/// form) for each tag in `filtered_tags`, matching the original's
/// `<{tag}[^>]*>.*?</{tag}>|<{tag}[^>]*/>` regex so attribute-bearing
/// elements (`<xaiartifact contentType="...">`) are elided, not just bare
/// `<tag>`. Idempotent: a second pass over already-stripped text finds no
/// matches.
pub fn strip_filtered_tag_blocks(text: &str, filtered_tags: &HashSet<String>) -> String {
    let mut out = text.to_string();
    for tag in filtered_tags {
        let escaped = regex::escape(tag);
        let pattern = format!(r"(?s)<{escaped}[^>]*>.*?</{escaped}>|<{escaped}[^>]*/>");
        if let Ok(re) = Regex::new(&pattern) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    out
}

pub struct ChatCollectProcessor {
    chat_id: String,
    model: String,
    text: String,
}

impl ChatCollectProcessor {
    pub fn new(chat_id: String, model: String) -> Self {
        Self {
            chat_id,
            model,
            text: String::new(),
        }
    }

    pub async fn handle_event(&mut self, event: UpstreamEvent, image_resolver: &dyn ImageUrlResolver) {
        match event {
            UpstreamEvent::Token { token } => self.text.push_str(&token),
            UpstreamEvent::ModelResponse {
                message,
                generated_image_urls,
                ..
            } => {
                if let Some(message) = message {
                    self.text.push_str(&message);
                }
                for url in generated_image_urls {
                    let resolved = image_resolver.resolve(&url).await;
                    self.text.push_str(&format!("\n![generated image]({resolved})"));
                }
            }
            _ => {}
        }
    }

    pub fn finish(self, filtered_tags: &HashSet<String>) -> ChatCompletionResponse {
        let content = strip_filtered_tag_blocks(&self.text, filtered_tags);
        ChatCompletionResponse {
            id: self.chat_id,
            object: "chat.completion",
            created: now_secs(),
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessageOut {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::stream::filter::default_filtered_tags;

    #[test]
    fn strips_configured_tag_blocks() {
        let text = "keep<xaiartifact>drop me</xaiartifact>keep2";
        let stripped = strip_filtered_tag_blocks(text, &default_filtered_tags());
        assert_eq!(stripped, "keepkeep2");
    }

    #[test]
    fn strips_tag_blocks_with_attributes() {
        let text = "keep<xaiartifact contentType=\"text/html\">drop me</xaiartifact>keep2";
        let stripped = strip_filtered_tag_blocks(text, &default_filtered_tags());
        assert_eq!(stripped, "keepkeep2");
    }

    #[test]
    fn strips_self_closing_tag_with_attributes() {
        let text = "keep<xaiartifact contentType=\"text/html\"/>keep2";
        let stripped = strip_filtered_tag_blocks(text, &default_filtered_tags());
        assert_eq!(stripped, "keepkeep2");
    }

    #[test]
    fn stripping_is_idempotent() {
        let text = "keep<xaiartifact>drop me</xaiartifact>keep2";
        let once = strip_filtered_tag_blocks(text, &default_filtered_tags());
        let twice = strip_filtered_tag_blocks(&once, &default_filtered_tags());
        assert_eq!(once, twice);
    }
}
