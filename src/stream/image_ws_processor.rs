//! Image WebSocket processor (C5.4).
//!
//! Grounded on `app/services/reverse/ws_imagine.py`
//! (`_parse_image_url`, `_is_final_image`, `_classify_image`): the upstream
//! sends multiple messages per image id with increasing blob size across
//! three stages (preview/medium/final); a message is final if its URL
//! extension is `.jpg`/`.jpeg` or its blob exceeds `final_min_bytes`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// One raw inbound WS image message, already demultiplexed from the
/// connector's text/binary frames (`upstream::image_ws`).
pub struct ImageWsMessage {
    pub image_id: String,
    pub url: Option<String>,
    pub blob_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Preview,
    Medium,
    Final,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ImageWsEvent {
    #[serde(rename = "image_generation.partial_image")]
    PartialImage { partial_image_index: u32 },
    #[serde(rename = "image_generation.completed")]
    Completed { index: u32 },
}

#[derive(Debug, thiserror::Error)]
#[error("upstream image generation appears blocked: no final image within timeout")]
pub struct ImageBlockedError;

pub struct ImageWsProcessorConfig {
    pub medium_min_bytes: usize,
    pub final_min_bytes: usize,
    pub final_timeout: Duration,
    pub blocked_grace: Duration,
}

pub struct ImageWsProcessor {
    n: u32,
    cfg: ImageWsProcessorConfig,
    best_stage: HashMap<String, Stage>,
    output_index: HashMap<String, u32>,
    next_output_index: u32,
    completed: u32,
    started_at: Instant,
    medium_received_at: Option<Instant>,
    final_received: bool,
}

fn classify(url: Option<&str>, blob_size: usize, cfg: &ImageWsProcessorConfig) -> Stage {
    let is_final_by_ext = url
        .map(|u| u.ends_with(".jpg") || u.ends_with(".jpeg"))
        .unwrap_or(false);
    if is_final_by_ext || blob_size > cfg.final_min_bytes {
        Stage::Final
    } else if blob_size >= cfg.medium_min_bytes {
        Stage::Medium
    } else {
        Stage::Preview
    }
}

impl ImageWsProcessor {
    pub fn new(n: u32, cfg: ImageWsProcessorConfig) -> Self {
        Self {
            n,
            cfg,
            best_stage: HashMap::new(),
            output_index: HashMap::new(),
            next_output_index: 0,
            completed: 0,
            started_at: Instant::now(),
            medium_received_at: None,
            final_received: false,
        }
    }

    pub fn done(&self) -> bool {
        self.completed >= self.n
    }

    /// Handles one inbound message, returning the SSE-shaped event to emit
    /// (if any). Duplicate/worse-stage updates for an already-seen image are
    /// ignored; images beyond `n` are dropped once all `n` slots are taken.
    pub fn handle_message(&mut self, msg: ImageWsMessage) -> Option<ImageWsEvent> {
        let stage = classify(msg.url.as_deref(), msg.blob_size, &self.cfg);
        let best = self.best_stage.entry(msg.image_id.clone()).or_insert(Stage::Preview);
        if stage <= *best && *best != Stage::Preview {
            return None;
        }
        *best = stage;

        match stage {
            Stage::Final => {
                if self.final_received == false {
                    self.medium_received_at = None;
                }
                self.final_received = true;
                if let Some(&index) = self.output_index.get(&msg.image_id) {
                    self.completed += 1;
                    return Some(ImageWsEvent::Completed { index });
                }
                if self.next_output_index >= self.n {
                    return None;
                }
                let index = self.next_output_index;
                self.next_output_index += 1;
                self.output_index.insert(msg.image_id.clone(), index);
                self.completed += 1;
                Some(ImageWsEvent::Completed { index })
            }
            Stage::Medium => {
                if self.medium_received_at.is_none() {
                    self.medium_received_at = Some(Instant::now());
                }
                Some(ImageWsEvent::PartialImage { partial_image_index: 1 })
            }
            Stage::Preview => Some(ImageWsEvent::PartialImage { partial_image_index: 0 }),
        }
    }

    /// Raises a blocked condition if no final image has arrived within
    /// `final_timeout` of the first medium, or within `blocked_grace` of
    /// session start if no medium has ever arrived.
    pub fn check_blocked(&self) -> Result<(), ImageBlockedError> {
        if self.done() {
            return Ok(());
        }
        match self.medium_received_at {
            Some(medium_at) if medium_at.elapsed() > self.cfg.final_timeout => Err(ImageBlockedError),
            None if self.started_at.elapsed() > self.cfg.blocked_grace => Err(ImageBlockedError),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cfg() -> ImageWsProcessorConfig {
        ImageWsProcessorConfig {
            medium_min_bytes: 1_000,
            final_min_bytes: 10_000,
            final_timeout: Duration::from_millis(50),
            blocked_grace: Duration::from_millis(50),
        }
    }

    #[test]
    fn classifies_stages_by_size_and_extension() {
        let c = cfg();
        assert_eq!(classify(None, 10, &c), Stage::Preview);
        assert_eq!(classify(None, 2_000, &c), Stage::Medium);
        assert_eq!(classify(None, 20_000, &c), Stage::Final);
        assert_eq!(classify(Some("https://x/a.jpg"), 10, &c), Stage::Final);
    }

    #[test]
    fn assigns_stable_output_index_on_first_final_sight() {
        let mut processor = ImageWsProcessor::new(2, cfg());
        let first = processor.handle_message(ImageWsMessage {
            image_id: "img-1".into(),
            url: Some("https://x/img-1.jpg".into()),
            blob_size: 500,
        });
        assert!(matches!(first, Some(ImageWsEvent::Completed { index: 0 })));
    }

    #[test]
    fn drops_images_beyond_n() {
        let mut processor = ImageWsProcessor::new(1, cfg());
        let _ = processor.handle_message(ImageWsMessage {
            image_id: "img-1".into(),
            url: Some("https://x/img-1.jpg".into()),
            blob_size: 500,
        });
        let second = processor.handle_message(ImageWsMessage {
            image_id: "img-2".into(),
            url: Some("https://x/img-2.jpg".into()),
            blob_size: 500,
        });
        assert!(second.is_none());
        assert!(processor.done());
    }

    #[test]
    fn blocked_after_final_timeout_since_first_medium() {
        let mut processor = ImageWsProcessor::new(1, cfg());
        let _ = processor.handle_message(ImageWsMessage {
            image_id: "img-1".into(),
            url: None,
            blob_size: 2_000,
        });
        std::thread::sleep(Duration::from_millis(60));
        assert!(processor.check_blocked().is_err());
    }
}
