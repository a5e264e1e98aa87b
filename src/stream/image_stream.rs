//! Image stream processor, HTTP variant (C5.3).
//!
//! Grounded on spec.md §4.5.3: collects `streamingImageGenerationResponse`
//! progress events and `modelResponse` completions into
//! `image_generation.partial_image` / `image_generation.completed` SSE
//! records. When `n == 1`, the upstream still produces (at least) two
//! candidates per call; the processor samples one `target_index` uniformly
//! at random up front and only emits that candidate's events.

use rand::Rng;
use serde::Serialize;

use super::chat_stream::ImageUrlResolver;
use super::UpstreamEvent;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ImageSseRecord {
    #[serde(rename = "image_generation.partial_image")]
    PartialImage { index: u32, progress: u32 },
    #[serde(rename = "image_generation.completed")]
    Completed { index: u32, url: Option<String>, b64_json: Option<String> },
}

pub struct ImageStreamProcessor {
    n: u32,
    target_index: Option<u32>,
    next_output_index: u32,
}

impl ImageStreamProcessor {
    pub fn new(n: u32) -> Self {
        let target_index = if n == 1 {
            Some(rand::thread_rng().gen_range(0..=1))
        } else {
            None
        };
        Self {
            n,
            target_index,
            next_output_index: 0,
        }
    }

    fn accepts(&self, image_index: u32) -> bool {
        self.target_index.is_none_or(|target| target == image_index)
    }

    pub fn handle_event(&mut self, event: &UpstreamEvent) -> Option<ImageSseRecord> {
        match event {
            UpstreamEvent::StreamingImageGenerationResponse { image_index, progress } => {
                if !self.accepts(*image_index) {
                    return None;
                }
                Some(ImageSseRecord::PartialImage {
                    index: *image_index,
                    progress: *progress,
                })
            }
            _ => None,
        }
    }

    /// Resolves a completed model response's image URLs into completion
    /// records, assigning stable sequential output indices capped at `n`.
    pub async fn handle_model_response(
        &mut self,
        generated_image_urls: &[String],
        resolver: &dyn ImageUrlResolver,
    ) -> Vec<ImageSseRecord> {
        let mut out = Vec::new();
        for url in generated_image_urls {
            if self.next_output_index >= self.n {
                break;
            }
            let resolved = resolver.resolve(url).await;
            out.push(ImageSseRecord::Completed {
                index: self.next_output_index,
                url: Some(resolved),
                b64_json: None,
            });
            self.next_output_index += 1;
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoResolver;
    #[async_trait]
    impl ImageUrlResolver for EchoResolver {
        async fn resolve(&self, upstream_url: &str) -> String {
            upstream_url.to_string()
        }
    }

    #[test]
    fn n_equals_one_only_emits_target_candidate_events() {
        let mut processor = ImageStreamProcessor::new(1);
        let target = processor.target_index.unwrap();
        let other = 1 - target;
        let accepted = processor.handle_event(&UpstreamEvent::StreamingImageGenerationResponse {
            image_index: target,
            progress: 50,
        });
        let rejected = processor.handle_event(&UpstreamEvent::StreamingImageGenerationResponse {
            image_index: other,
            progress: 50,
        });
        assert!(accepted.is_some());
        assert!(rejected.is_none());
    }

    #[tokio::test]
    async fn completion_events_assign_sequential_indices_capped_at_n() {
        let mut processor = ImageStreamProcessor::new(1);
        let records = processor
            .handle_model_response(&["https://x/a.jpg".into(), "https://x/b.jpg".into()], &EchoResolver)
            .await;
        assert_eq!(records.len(), 1);
        match &records[0] {
            ImageSseRecord::Completed { index, .. } => assert_eq!(*index, 0),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
