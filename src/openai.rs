//! OpenAI-compatible wire types for the client-facing surface (§6.1).
//!
//! Grounded on `src/llm.rs`'s `ChatCompletionRequest`/`ChatCompletionResponse`
//! shapes, extended with the streaming chunk, image, and model-list shapes
//! the spec's HTTP surface needs that the teacher's single non-streaming
//! chat client didn't carry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub thinking: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessageOut,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageOut {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatChunkChoice {
    pub index: u32,
    pub delta: ChatDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    pub model: Option<String>,
    #[serde(default = "default_n")]
    pub n: u32,
    pub size: Option<String>,
    pub response_format: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

fn default_n() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageGenerationResponse {
    pub created: u64,
    pub data: Vec<ImageDatum>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageDatum {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
}

/// One image attached to a `/v1/images/edits` multipart request, decoded by
/// the gateway layer from the incoming form fields.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Parsed from the `/v1/images/edits` multipart form; built by the gateway
/// layer rather than derived via `Deserialize` since it comes off an axum
/// `Multipart` extractor, not a JSON body.
#[derive(Debug, Clone)]
pub struct ImageEditRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub images: Vec<UploadedImage>,
    pub n: u32,
    pub response_format: Option<String>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelListResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoGenerationRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub aspect_ratio: String,
    pub video_length: u32,
    pub resolution_name: String,
    pub preset: String,
    #[serde(default)]
    pub stream: bool,
}

/// Admin batch endpoints accept either a single `token` or a `tokens` list,
/// bounded by `app.max_tokens` (spec.md §6.1).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminBatchRequest {
    pub token: Option<String>,
    pub tokens: Option<Vec<String>>,
}

impl AdminBatchRequest {
    pub fn into_tokens(self) -> Vec<String> {
        let mut tokens = self.tokens.unwrap_or_default();
        if let Some(single) = self.token {
            tokens.push(single);
        }
        tokens
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminBatchAccepted {
    pub task_id: String,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoGenerationResponse {
    pub created: u64,
    pub data: Vec<VideoDatum>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoDatum {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceTokenResponse {
    pub token: String,
    pub url: &'static str,
    pub participant_name: String,
    pub room_name: String,
}
