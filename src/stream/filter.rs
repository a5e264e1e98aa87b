//! Cross-chunk filtered-tag state machine (C5.1 collaborator).
//!
//! Grounded on spec.md §4.5.1/§9: the default filtered-tag set
//! (`grok:render`, `xaiartifact`, `xai:tool_usage_card`) must be elided from
//! the token stream even when a `<tag>`/`</tag>` pair straddles two
//! separate upstream chunks. This is deliberately a per-stream owned buffer
//! (§9 "global filter-tag state machine"), not a per-call pure function.

use std::collections::HashSet;

pub fn default_filtered_tags() -> HashSet<String> {
    ["grok:render", "xaiartifact", "xai:tool_usage_card"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone)]
enum FilterState {
    Normal,
    Suppressing(String),
}

enum OpenTagMatch {
    /// A full `<tag ...>` or self-closing `<tag .../>` was recognized;
    /// `consumed` is the byte length of the whole opening tag.
    Full {
        tag: String,
        self_closing: bool,
        consumed: usize,
    },
    Partial,
    None,
}

/// Owns the cross-chunk buffer for one stream; not `Clone`/`Copy` on purpose.
pub struct TagFilter {
    tags: HashSet<String>,
    buffer: String,
    state: FilterState,
}

impl TagFilter {
    pub fn new(tags: HashSet<String>) -> Self {
        Self {
            tags,
            buffer: String::new(),
            state: FilterState::Normal,
        }
    }

    /// Matches `<tag[^>]*>` or the self-closing `<tag[^>]*/>` form at the
    /// start of `tail`, mirroring the original's
    /// `<{tag}[^>]*>.*?</{tag}>|<{tag}[^>]*/>` regex. A tag name must be
    /// followed by `>`, `/`, whitespace, or end-of-buffer (awaiting more
    /// data) — never by another identifier character — so `xaiartifact`
    /// does not match a hypothetical `xaiartifactx` element.
    fn match_open_tag(&self, tail: &str) -> OpenTagMatch {
        let mut any_partial = false;
        for tag in &self.tags {
            let prefix = format!("<{tag}");
            if tail.len() < prefix.len() {
                if prefix.starts_with(tail) {
                    any_partial = true;
                }
                continue;
            }
            if !tail.starts_with(prefix.as_str()) {
                continue;
            }
            let rest = &tail[prefix.len()..];
            let Some(boundary) = rest.chars().next() else {
                any_partial = true;
                continue;
            };
            if boundary != '>' && boundary != '/' && !boundary.is_whitespace() {
                continue;
            }
            match rest.find('>') {
                Some(gt_pos) => {
                    let self_closing = gt_pos > 0 && rest.as_bytes()[gt_pos - 1] == b'/';
                    return OpenTagMatch::Full {
                        tag: tag.clone(),
                        self_closing,
                        consumed: prefix.len() + gt_pos + 1,
                    };
                }
                None => any_partial = true,
            }
        }
        if any_partial {
            OpenTagMatch::Partial
        } else {
            OpenTagMatch::None
        }
    }

    /// Feeds one more chunk of upstream token text; returns the text safe to
    /// emit now (ambiguous trailing bytes are held back in the buffer).
    pub fn push(&mut self, chunk: &str) -> String {
        self.buffer.push_str(chunk);
        let mut output = String::new();

        loop {
            match self.state.clone() {
                FilterState::Normal => {
                    let Some(pos) = self.buffer.find('<') else {
                        output.push_str(&self.buffer);
                        self.buffer.clear();
                        break;
                    };
                    output.push_str(&self.buffer[..pos]);
                    let tail = self.buffer[pos..].to_string();
                    match self.match_open_tag(&tail) {
                        OpenTagMatch::Full { tag, self_closing, consumed } => {
                            self.buffer = tail[consumed..].to_string();
                            if !self_closing {
                                self.state = FilterState::Suppressing(tag);
                            }
                        }
                        OpenTagMatch::Partial => {
                            self.buffer = tail;
                            break;
                        }
                        OpenTagMatch::None => {
                            output.push('<');
                            self.buffer = tail[1..].to_string();
                        }
                    }
                }
                FilterState::Suppressing(tag) => {
                    let close = format!("</{tag}>");
                    if let Some(pos) = self.buffer.find(close.as_str()) {
                        self.buffer = self.buffer[pos + close.len()..].to_string();
                        self.state = FilterState::Normal;
                    } else {
                        break;
                    }
                }
            }
        }

        output
    }

    /// Flushes remaining state at stream end. Unterminated suppressed
    /// content is dropped; unterminated plain text (an incomplete tag
    /// prefix that never resolved) is emitted as literal text.
    pub fn finish(&mut self) -> String {
        match self.state {
            FilterState::Normal => std::mem::take(&mut self.buffer),
            FilterState::Suppressing(_) => {
                self.buffer.clear();
                String::new()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_plain_text() {
        let mut filter = TagFilter::new(default_filtered_tags());
        assert_eq!(filter.push("hello world"), "hello world");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn elides_single_chunk_tag() {
        let mut filter = TagFilter::new(default_filtered_tags());
        let out = filter.push("before<grok:render>hidden</grok:render>after");
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn elides_tag_spanning_chunk_boundaries() {
        let mut filter = TagFilter::new(default_filtered_tags());
        let mut out = String::new();
        out.push_str(&filter.push("before<grok:"));
        out.push_str(&filter.push("render>hid"));
        out.push_str(&filter.push("den</grok:ren"));
        out.push_str(&filter.push("der>after"));
        out.push_str(&filter.finish());
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn unrelated_angle_bracket_passes_through() {
        let mut filter = TagFilter::new(default_filtered_tags());
        let out = filter.push("a < b and c > d");
        assert_eq!(out, "a < b and c > d");
    }

    #[test]
    fn elides_tag_with_attributes() {
        let mut filter = TagFilter::new(default_filtered_tags());
        let out = filter.push("before<xaiartifact contentType=\"text/html\">hidden</xaiartifact>after");
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn elides_self_closing_tag_with_attributes() {
        let mut filter = TagFilter::new(default_filtered_tags());
        let out = filter.push("before<xaiartifact contentType=\"text/html\"/>after");
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn attributes_split_across_chunk_boundary() {
        let mut filter = TagFilter::new(default_filtered_tags());
        let mut out = String::new();
        out.push_str(&filter.push("before<xaiartifact conten"));
        out.push_str(&filter.push("tType=\"text/html\">hid"));
        out.push_str(&filter.push("den</xaiartifact>after"));
        out.push_str(&filter.finish());
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn filtering_is_idempotent() {
        let mut first = TagFilter::new(default_filtered_tags());
        let mut out = first.push("keep<xaiartifact>drop me</xaiartifact>keep2");
        out.push_str(&first.finish());

        let mut second = TagFilter::new(default_filtered_tags());
        let mut out2 = second.push(&out);
        out2.push_str(&second.finish());

        assert_eq!(out, out2);
    }
}
