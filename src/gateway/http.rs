//! The client-facing HTTP surface (spec.md §6.1): OpenAI-compatible chat,
//! image, and video endpoints, cached-asset serving, the voice-token broker,
//! and the app-key-protected admin batch surface.
//!
//! Grounded on the teacher's `src/gateway/http.rs` (axum `Router`, a shared
//! `State`, SIGINT/SIGTERM graceful shutdown) generalized from a single
//! `POST /message` route to the full multi-endpoint surface this gateway
//! exposes, plus `app/core/auth.py`'s bearer-token check in the original for
//! the admin routes' `app_key` gate.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;

use crate::app::AppState;
use crate::batch::BatchEvent;
use crate::entrypoints::{admin, chat, image, image_edit, video};
use crate::error::AppError;
use crate::openai::{
    AdminBatchAccepted, AdminBatchRequest, ChatCompletionRequest, ImageEditRequest, ImageGenerationRequest,
    ModelListResponse, ModelObject, UploadedImage, VideoGenerationRequest,
};

/// 15-second keepalive per spec.md §4.6: emitted whenever the batch SSE
/// bridge sees no event arrive in that window.
const BATCH_KEEPALIVE_SECS: u64 = 15;

/// Builds the full router, admin routes gated behind `app.app_key` when set.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/images/edits", post(images_edits))
        .route("/v1/video/generations", post(video_generations))
        .route("/v1/files/{media_type}/{path}", get(serve_file))
        .route("/v1/admin/voice/token", get(voice_token));

    let admin = Router::new()
        .route("/admin/tokens/refresh/async", post(admin_tokens_refresh))
        .route("/admin/tokens/nsfw/enable/async", post(admin_nsfw_enable))
        .route("/admin/cache/online/clear/async", post(admin_cache_clear))
        .route("/admin/cache/online/load/async", post(admin_cache_load))
        .route("/admin/batch/{task_id}/stream", get(admin_batch_stream))
        .route("/admin/batch/{task_id}/cancel", post(admin_batch_cancel))
        .layer(middleware::from_fn_with_state(state.clone(), require_app_key));

    Router::new().merge(public).merge(admin).with_state(state)
}

/// Runs the HTTP server until Ctrl+C (SIGINT) or SIGTERM; in-flight requests
/// finish before the process exits.
pub async fn run_http(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(event = "gateway_listening", addr = bind_addr, "gateway listening (Ctrl+C/SIGTERM to stop)");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!(event = "gateway_stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::warn!(event = "sigterm_listen_failed", error = %err);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Rejects admin requests unless `Authorization: Bearer <app_key>` matches
/// the configured key. No key configured means the admin surface is open
/// (local/dev use), mirroring the original's "skip verification" fallback.
async fn require_app_key(State(state): State<AppState>, headers: HeaderMap, request: axum::extract::Request, next: Next) -> Response {
    let Some(expected) = state.settings.app.app_key.as_deref() else {
        return next.run(request).await;
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(key) if key == expected => next.run(request).await,
        _ => AppError::Authentication("missing or invalid admin app key".to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------

async fn chat_completions(State(state): State<AppState>, Json(request): Json<ChatCompletionRequest>) -> Response {
    match chat::chat_completions(state, request).await {
        Ok(chat::ChatOutcome::Collected(response)) => Json(response).into_response(),
        Ok(chat::ChatOutcome::Streaming(stream)) => sse_from_lines(stream),
        Err(err) => err.into_response(),
    }
}

// ---------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------

async fn list_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    Json(ModelListResponse {
        object: "list",
        data: state.models.list().into_iter().map(to_model_object).collect(),
    })
}

async fn get_model(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.models.get(&id) {
        Some(descriptor) => Json(to_model_object(descriptor)).into_response(),
        None => {
            let envelope = AppError::validation(format!("unknown model \"{id}\"")).to_envelope();
            (StatusCode::NOT_FOUND, Json(envelope)).into_response()
        }
    }
}

fn to_model_object(descriptor: &crate::models::ModelDescriptor) -> ModelObject {
    ModelObject {
        id: descriptor.external_id.clone(),
        object: "model",
        owned_by: "grok-gateway",
    }
}

// ---------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------

async fn images_generations(State(state): State<AppState>, Json(request): Json<ImageGenerationRequest>) -> Response {
    match image::generate(state, request).await {
        Ok(image::ImageOutcome::Collected(response)) => Json(response).into_response(),
        Ok(image::ImageOutcome::Streaming(stream)) => sse_from_lines(stream),
        Err(err) => err.into_response(),
    }
}

async fn images_edits(State(state): State<AppState>, multipart: Multipart) -> Response {
    match parse_image_edit_request(multipart).await {
        Ok(request) => match image_edit::edit(state, request).await {
            Ok(image_edit::ImageEditOutcome::Collected(response)) => Json(response).into_response(),
            Ok(image_edit::ImageEditOutcome::Streaming(stream)) => sse_from_lines(stream),
            Err(err) => err.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

/// Reads the `/v1/images/edits` multipart form into an [`ImageEditRequest`];
/// `image` may repeat for multiple files, everything else is a single field.
async fn parse_image_edit_request(mut multipart: Multipart) -> Result<ImageEditRequest, AppError> {
    let mut prompt = None;
    let mut model = None;
    let mut images = Vec::new();
    let mut n = 1u32;
    let mut response_format = None;
    let mut stream = false;

    while let Some(field) = multipart.next_field().await.map_err(|err| AppError::validation(err.to_string()))? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "prompt" => prompt = Some(field.text().await.map_err(|err| AppError::validation(err.to_string()))?),
            "model" => model = Some(field.text().await.map_err(|err| AppError::validation(err.to_string()))?),
            "n" => {
                let text = field.text().await.map_err(|err| AppError::validation(err.to_string()))?;
                n = text.trim().parse().map_err(|_| AppError::validation("n must be an integer"))?;
            }
            "response_format" => {
                response_format = Some(field.text().await.map_err(|err| AppError::validation(err.to_string()))?)
            }
            "stream" => {
                let text = field.text().await.map_err(|err| AppError::validation(err.to_string()))?;
                stream = text.trim().eq_ignore_ascii_case("true") || text.trim() == "1";
            }
            "image" | "image[]" => {
                let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
                let bytes = field.bytes().await.map_err(|err| AppError::validation(err.to_string()))?;
                images.push(UploadedImage { bytes: bytes.to_vec(), content_type });
            }
            _ => {}
        }
    }

    Ok(ImageEditRequest {
        prompt: prompt.ok_or_else(|| AppError::validation("prompt is required"))?,
        model,
        images,
        n,
        response_format,
        stream,
    })
}

// ---------------------------------------------------------------------
// Video
// ---------------------------------------------------------------------

const VALID_ASPECT_RATIOS: &[&str] = &["16:9", "9:16", "3:2", "2:3", "1:1"];
const VALID_VIDEO_LENGTHS: &[u32] = &[6, 10, 15];
const VALID_RESOLUTIONS: &[&str] = &["480p", "720p"];
const VALID_PRESETS: &[&str] = &["fun", "normal", "spicy", "custom"];

fn validate_video_request(request: &VideoGenerationRequest) -> Result<(), AppError> {
    if !VALID_ASPECT_RATIOS.contains(&request.aspect_ratio.as_str()) {
        return Err(AppError::validation(format!(
            "aspect_ratio must be one of {VALID_ASPECT_RATIOS:?}, got \"{}\"",
            request.aspect_ratio
        )));
    }
    if !VALID_VIDEO_LENGTHS.contains(&request.video_length) {
        return Err(AppError::validation(format!(
            "video_length must be one of {VALID_VIDEO_LENGTHS:?}, got {}",
            request.video_length
        )));
    }
    if !VALID_RESOLUTIONS.contains(&request.resolution_name.as_str()) {
        return Err(AppError::validation(format!(
            "resolution_name must be one of {VALID_RESOLUTIONS:?}, got \"{}\"",
            request.resolution_name
        )));
    }
    if !VALID_PRESETS.contains(&request.preset.as_str()) {
        return Err(AppError::validation(format!("preset must be one of {VALID_PRESETS:?}, got \"{}\"", request.preset)));
    }
    Ok(())
}

async fn video_generations(State(state): State<AppState>, Json(request): Json<VideoGenerationRequest>) -> Response {
    if let Err(err) = validate_video_request(&request) {
        return err.into_response();
    }
    match video::generate(state, request).await {
        Ok(video::VideoOutcome::Collected(response)) => Json(response).into_response(),
        Ok(video::VideoOutcome::Streaming(stream)) => sse_from_lines(stream),
        Err(err) => err.into_response(),
    }
}

// ---------------------------------------------------------------------
// Cached asset serving
// ---------------------------------------------------------------------

async fn serve_file(State(state): State<AppState>, Path((media_type, path)): Path<(String, String)>) -> Response {
    let media_type = match media_type.as_str() {
        "images" => crate::asset_cache::MediaType::Image,
        "videos" => crate::asset_cache::MediaType::Video,
        other => {
            let envelope = AppError::validation(format!("unknown media type \"{other}\"")).to_envelope();
            return (StatusCode::NOT_FOUND, Json(envelope)).into_response();
        }
    };
    let Some(local_path) = state.asset_cache.lookup(media_type, &path).await else {
        let envelope = AppError::validation("asset not found").to_envelope();
        return (StatusCode::NOT_FOUND, Json(envelope)).into_response();
    };
    match tokio::fs::read(&local_path).await {
        Ok(bytes) => {
            let content_type = match media_type {
                crate::asset_cache::MediaType::Image => "image/png",
                crate::asset_cache::MediaType::Video => "video/mp4",
            };
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(_) => {
            let envelope = AppError::validation("asset not found").to_envelope();
            (StatusCode::NOT_FOUND, Json(envelope)).into_response()
        }
    }
}

// ---------------------------------------------------------------------
// Voice token broker
// ---------------------------------------------------------------------

async fn voice_token(State(state): State<AppState>) -> Response {
    match admin::voice_token(state).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

// ---------------------------------------------------------------------
// Admin batch endpoints
// ---------------------------------------------------------------------

fn bounded_tokens(state: &AppState, request: AdminBatchRequest) -> Result<Vec<String>, AppError> {
    let tokens = request.into_tokens();
    if tokens.is_empty() {
        return Err(AppError::validation("token or tokens is required"));
    }
    let max = state.settings.app.max_tokens() as usize;
    if tokens.len() > max {
        return Err(AppError::validation(format!("too many tokens; maximum is {max}")));
    }
    Ok(tokens)
}

async fn admin_tokens_refresh(State(state): State<AppState>, Json(request): Json<AdminBatchRequest>) -> Response {
    let tokens = match bounded_tokens(&state, request) {
        Ok(tokens) => tokens,
        Err(err) => return err.into_response(),
    };
    let total = tokens.len();
    let task = admin::refresh_tokens(state, tokens).await;
    Json(AdminBatchAccepted { task_id: task.id.clone(), total }).into_response()
}

async fn admin_nsfw_enable(State(state): State<AppState>, Json(request): Json<AdminBatchRequest>) -> Response {
    let tokens = match bounded_tokens(&state, request) {
        Ok(tokens) => tokens,
        Err(err) => return err.into_response(),
    };
    let total = tokens.len();
    let task = admin::nsfw_enable(state, tokens).await;
    Json(AdminBatchAccepted { task_id: task.id.clone(), total }).into_response()
}

async fn admin_cache_clear(State(state): State<AppState>, Json(request): Json<AdminBatchRequest>) -> Response {
    let tokens = match bounded_tokens(&state, request) {
        Ok(tokens) => tokens,
        Err(err) => return err.into_response(),
    };
    let total = tokens.len();
    let task = admin::cache_online_clear(state, tokens).await;
    Json(AdminBatchAccepted { task_id: task.id.clone(), total }).into_response()
}

async fn admin_cache_load(State(state): State<AppState>, Json(request): Json<AdminBatchRequest>) -> Response {
    let tokens = match bounded_tokens(&state, request) {
        Ok(tokens) => tokens,
        Err(err) => return err.into_response(),
    };
    let total = tokens.len();
    let task = admin::cache_online_load(state, tokens).await;
    Json(AdminBatchAccepted { task_id: task.id.clone(), total }).into_response()
}

async fn admin_batch_cancel(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    if admin::cancel_task(&state, &task_id).await {
        StatusCode::ACCEPTED.into_response()
    } else {
        let envelope = AppError::validation(format!("unknown task \"{task_id}\"")).to_envelope();
        (StatusCode::NOT_FOUND, Json(envelope)).into_response()
    }
}

/// SSE bridge (spec.md §4.6): attaches a subscriber, emits a 15s keepalive
/// ping whenever no event arrives in that window, closes after the terminal
/// event (or immediately if the client disconnects — axum drops the stream).
async fn admin_batch_stream(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let Some(task) = admin::get_task(&state, &task_id).await else {
        let envelope = AppError::validation(format!("unknown task \"{task_id}\"")).to_envelope();
        return (StatusCode::NOT_FOUND, Json(envelope)).into_response();
    };

    let body_stream = async_stream::stream! {
        let mut rx = task.attach().await;
        loop {
            match tokio::time::timeout(Duration::from_secs(BATCH_KEEPALIVE_SECS), rx.recv()).await {
                Ok(Some(event)) => {
                    let terminal = !matches!(event, BatchEvent::Progress { .. });
                    yield Ok::<_, Infallible>(sse_event_bytes(&event));
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => yield Ok(Bytes::from_static(b": keepalive\n\n")),
            }
        }
    };

    sse_response(Body::from_stream(body_stream))
}

fn sse_event_bytes(event: &BatchEvent) -> Bytes {
    let data = serde_json::to_string(event).unwrap_or_default();
    Bytes::from(format!("data: {data}\n\n"))
}

// ---------------------------------------------------------------------
// SSE plumbing shared by chat/image/video streaming responses
// ---------------------------------------------------------------------

/// Adapts an entrypoint's `Result<String, AppError>` line stream (each item
/// already a fully formed `data: ...\n\n` record) into an SSE HTTP response.
/// A mid-stream error (spec.md §5: "terminal SSE `event: error` … if the
/// failure occurs after headers are sent") is rendered as one final
/// `event: error` record and then the stream ends.
fn sse_from_lines(lines: impl Stream<Item = Result<String, AppError>> + Send + 'static) -> Response {
    let body_stream = async_stream::stream! {
        tokio::pin!(lines);
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => yield Ok::<_, Infallible>(Bytes::from(line)),
                Err(err) => {
                    let envelope = err.to_envelope();
                    let data = serde_json::to_string(&envelope).unwrap_or_default();
                    yield Ok(Bytes::from(format!("event: error\ndata: {data}\n\n")));
                    break;
                }
            }
        }
    };
    sse_response(Body::from_stream(body_stream))
}

fn sse_response(body: Body) -> Response {
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
