//! Video stream processor (C5.5).
//!
//! Grounded on spec.md §4.5.5: tracks `streamingVideoGenerationResponse`
//! progress, and on 100% resolves the completed asset URL (through C7 if
//! caching is enabled) and emits either a raw URL or an HTML `<video>` tag
//! per `app.video_format`.

use async_trait::async_trait;
use serde::Serialize;

use super::UpstreamEvent;

#[async_trait]
pub trait VideoUrlResolver: Send + Sync {
    /// Resolves one upstream video asset URL into the final URL the client
    /// is handed (a rewritten gateway URL when caching is enabled, or the
    /// raw upstream URL otherwise).
    async fn resolve(&self, upstream_url: &str) -> String;
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum VideoSseRecord {
    #[serde(rename = "video_generation.progress")]
    Progress { progress: u32 },
    #[serde(rename = "video_generation.completed")]
    Completed { content: String },
}

pub struct VideoStreamProcessor {
    format: VideoFormat,
    completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoFormat {
    Url,
    Html,
}

impl VideoFormat {
    fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("html") {
            VideoFormat::Html
        } else {
            VideoFormat::Url
        }
    }

    fn render(self, url: &str) -> String {
        match self {
            VideoFormat::Url => url.to_string(),
            VideoFormat::Html => format!("<video controls src=\"{url}\"></video>"),
        }
    }
}

impl VideoStreamProcessor {
    pub fn new(video_format: &str) -> Self {
        Self {
            format: VideoFormat::from_config(video_format),
            completed: false,
        }
    }

    /// Handles one classified upstream event, returning a progress record
    /// for partial progress. Completion is driven separately through
    /// [`Self::complete`] once the caller has the resolved asset URL (the
    /// 100% progress event alone does not carry the final URL).
    pub fn handle_event(&mut self, event: &UpstreamEvent) -> Option<VideoSseRecord> {
        match event {
            UpstreamEvent::StreamingVideoGenerationResponse { progress } => {
                Some(VideoSseRecord::Progress { progress: *progress })
            }
            _ => None,
        }
    }

    /// Resolves `upstream_url` through `resolver` and emits the single
    /// completion record. Idempotent: a second call after the stream has
    /// already completed returns `None`.
    pub async fn complete(&mut self, upstream_url: &str, resolver: &dyn VideoUrlResolver) -> Option<VideoSseRecord> {
        if self.completed {
            return None;
        }
        self.completed = true;
        let resolved = resolver.resolve(upstream_url).await;
        Some(VideoSseRecord::Completed {
            content: self.format.render(&resolved),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct EchoResolver;
    #[async_trait]
    impl VideoUrlResolver for EchoResolver {
        async fn resolve(&self, upstream_url: &str) -> String {
            upstream_url.to_string()
        }
    }

    #[test]
    fn progress_events_pass_through() {
        let mut processor = VideoStreamProcessor::new("url");
        let record = processor
            .handle_event(&UpstreamEvent::StreamingVideoGenerationResponse { progress: 42 })
            .unwrap();
        match record {
            VideoSseRecord::Progress { progress } => assert_eq!(progress, 42),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_renders_raw_url_by_default() {
        let mut processor = VideoStreamProcessor::new("url");
        let record = processor.complete("https://x/video.mp4", &EchoResolver).await.unwrap();
        match record {
            VideoSseRecord::Completed { content } => assert_eq!(content, "https://x/video.mp4"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_renders_html_tag_when_configured() {
        let mut processor = VideoStreamProcessor::new("html");
        let record = processor.complete("https://x/video.mp4", &EchoResolver).await.unwrap();
        match record {
            VideoSseRecord::Completed { content } => {
                assert!(content.contains("<video"));
                assert!(content.contains("https://x/video.mp4"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let mut processor = VideoStreamProcessor::new("url");
        assert!(processor.complete("https://x/video.mp4", &EchoResolver).await.is_some());
        assert!(processor.complete("https://x/video.mp4", &EchoResolver).await.is_none());
    }
}
