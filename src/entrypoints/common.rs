//! Shared request-entrypoint scaffolding (C9): the cross-token retry loop
//! and the asset-resolver adapters every chat/image/video entrypoint needs.
//!
//! Grounded on `src/agent.rs`'s turn loop in the teacher (pick a
//! collaborator, run one attempt, decide whether to retry) generalized from
//! a single-collaborator retry to the pool-aware fallover spec.md §4.9
//! describes.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::app::AppState;
use crate::asset_cache::MediaType;
use crate::error::{AppError, UpstreamError};
use crate::models::ModelDescriptor;
use crate::stream::chat_stream::ImageUrlResolver;
use crate::stream::video_stream::VideoUrlResolver;
use crate::token_pool::TokenInfo;

/// One chosen token plus the pool it was drawn from, threaded through an
/// attempt so fail/success/rate-limit feedback can be attributed back.
#[derive(Debug, Clone)]
pub struct TokenAttempt {
    pub pool: String,
    pub token: TokenInfo,
}

/// Picks a usable token from `pool_candidates`, excluding `tried`. On a
/// first miss (`tried` empty) it refreshes cooling tokens once and retries
/// the pick before giving up — SPEC_FULL.md §D.1's resolution of the "what
/// happens when every pool is cooling" open question.
pub async fn pick_token(state: &AppState, pool_candidates: &[String], tried: &HashSet<String>) -> Option<TokenAttempt> {
    if let Some(attempt) = pick_once(state, pool_candidates, tried).await {
        return Some(attempt);
    }
    if tried.is_empty() {
        let _ = state.token_pool.refresh_cooling_tokens(state.usage_syncer.as_ref()).await;
        return pick_once(state, pool_candidates, tried).await;
    }
    None
}

async fn pick_once(state: &AppState, pool_candidates: &[String], tried: &HashSet<String>) -> Option<TokenAttempt> {
    for pool in pool_candidates {
        if let Some(token) = state.token_pool.get_token(pool, tried).await {
            return Some(TokenAttempt { pool: pool.clone(), token });
        }
    }
    None
}

/// Video-specific pick: delegates to `get_token_for_video` for the
/// super-pool escalation rule (720p or >6s), then resolves which pool the
/// returned token actually lives in since the manager doesn't say.
pub async fn pick_video_token(
    state: &AppState,
    resolution: &str,
    length_secs: u32,
    pool_candidates: &[String],
    tried: &HashSet<String>,
) -> Option<TokenAttempt> {
    if let Some(attempt) = pick_video_once(state, resolution, length_secs, pool_candidates, tried).await {
        return Some(attempt);
    }
    if tried.is_empty() {
        let _ = state.token_pool.refresh_cooling_tokens(state.usage_syncer.as_ref()).await;
        return pick_video_once(state, resolution, length_secs, pool_candidates, tried).await;
    }
    None
}

async fn pick_video_once(
    state: &AppState,
    resolution: &str,
    length_secs: u32,
    pool_candidates: &[String],
    tried: &HashSet<String>,
) -> Option<TokenAttempt> {
    let token = state
        .token_pool
        .get_token_for_video(resolution, length_secs, pool_candidates, tried)
        .await?;
    let pool = resolve_pool_name(state, &token.token).await?;
    Some(TokenAttempt { pool, token })
}

pub async fn resolve_pool_name(state: &AppState, token: &str) -> Option<String> {
    let snapshot = state.token_pool.snapshot().await;
    snapshot
        .into_iter()
        .find(|(_, infos)| infos.iter().any(|t| t.token == token))
        .map(|(pool, _)| pool)
}

/// Raised when every pool candidate is exhausted across the retry loop.
pub fn exhausted_error() -> AppError {
    AppError::rate_limit_exceeded("no tokens available across candidate pools")
}

/// Resolves the effective image/video response format: the per-request
/// `response_format` field if present and valid, else `app.image_format`.
/// `"base64"` is accepted as a synonym for `"b64_json"` (spec.md §6.1).
pub fn resolve_image_format(state: &AppState, requested: Option<&str>) -> Result<String, AppError> {
    match requested {
        None => Ok(state.settings.app.image_format()),
        Some("url") => Ok("url".to_string()),
        Some("b64_json") | Some("base64") => Ok("b64_json".to_string()),
        Some(other) => Err(AppError::validation(format!(
            "response_format must be one of [\"url\", \"b64_json\", \"base64\"], got \"{other}\""
        ))),
    }
}

/// Looks up a model by its public id, rejecting mismatched image/video use.
pub fn lookup_model(state: &AppState, model_id: &str, want_image: bool, want_video: bool) -> Result<ModelDescriptor, AppError> {
    let descriptor = state
        .models
        .get(model_id)
        .cloned()
        .ok_or_else(|| AppError::validation(format!("unknown model \"{model_id}\"")))?;
    if want_image && !descriptor.is_image {
        return Err(AppError::validation(format!("model \"{model_id}\" does not support image generation")));
    }
    if want_video && !descriptor.is_video {
        return Err(AppError::validation(format!("model \"{model_id}\" does not support video generation")));
    }
    Ok(descriptor)
}

/// Strips scheme and host from an upstream asset URL, leaving the
/// asset-relative path `download_asset_to` expects.
fn asset_relative_path(asset_url: &str) -> String {
    match asset_url.split_once("://") {
        Some((_, rest)) => rest.splitn(2, '/').nth(1).unwrap_or("").to_string(),
        None => asset_url.trim_start_matches('/').to_string(),
    }
}

async fn resolve_asset(
    state: &AppState,
    media_type: MediaType,
    upstream_url: &str,
    token: &str,
    dynamic_statsig: bool,
    format_override: Option<&str>,
) -> Option<String> {
    let format = format_override.map(str::to_string).unwrap_or_else(|| match media_type {
        MediaType::Image => state.settings.app.image_format(),
        MediaType::Video => state.settings.app.video_format(),
    });

    let upstream = state.upstream.clone();
    let retry_cfg = state.retry_cfg.clone();
    let token = token.to_string();
    let asset_path = asset_relative_path(upstream_url);
    let downloader = move |dest: PathBuf| {
        let upstream = upstream.clone();
        let retry_cfg = retry_cfg.clone();
        let token = token.clone();
        let asset_path = asset_path.clone();
        async move {
            upstream
                .download_asset_to(&token, dynamic_statsig, &retry_cfg, &asset_path, &dest)
                .await
                .map_err(anyhow::Error::from)
        }
    };

    if format == "b64_json" {
        let mime = match media_type {
            MediaType::Image => "image/png",
            MediaType::Video => "video/mp4",
        };
        let encoded = state.asset_cache.download_to_base64(media_type, upstream_url, downloader).await.ok()?;
        Some(format!("data:{mime};base64,{encoded}"))
    } else {
        let dir = match media_type {
            MediaType::Image => "images",
            MediaType::Video => "videos",
        };
        state.asset_cache.download(media_type, upstream_url, downloader).await.ok()?;
        Some(format!("/v1/files/{dir}/{}", crate::asset_cache::cache_filename(upstream_url)))
    }
}

/// Downloads, caches, and rewrites an upstream image URL into either a
/// gateway-served path or a base64 data URI. `format_override` carries a
/// per-request `response_format` when the caller has one (image
/// generation/edits); `None` falls back to `app.image_format`.
pub struct GatewayImageResolver {
    pub state: AppState,
    pub token: String,
    pub dynamic_statsig: bool,
    pub format_override: Option<String>,
}

#[async_trait]
impl ImageUrlResolver for GatewayImageResolver {
    async fn resolve(&self, upstream_url: &str) -> String {
        resolve_asset(
            &self.state,
            MediaType::Image,
            upstream_url,
            &self.token,
            self.dynamic_statsig,
            self.format_override.as_deref(),
        )
        .await
        .unwrap_or_else(|| upstream_url.to_string())
    }
}

/// Same as [`GatewayImageResolver`] for the video media type.
pub struct GatewayVideoResolver {
    pub state: AppState,
    pub token: String,
    pub dynamic_statsig: bool,
}

#[async_trait]
impl VideoUrlResolver for GatewayVideoResolver {
    async fn resolve(&self, upstream_url: &str) -> String {
        resolve_asset(&self.state, MediaType::Video, upstream_url, &self.token, self.dynamic_statsig, None)
            .await
            .unwrap_or_else(|| upstream_url.to_string())
    }
}

/// Converts an [`UpstreamError`] surfaced after the retry loop gives up into
/// the client-facing envelope.
pub fn upstream_to_app_error(err: UpstreamError) -> AppError {
    AppError::from(err)
}

/// Strips a `data:<mime>;base64,` prefix off a resolved asset string, for
/// call sites (the images API's `b64_json` field) that want the bare base64
/// payload rather than the inline data URI `GatewayImageResolver` produces
/// for chat's markdown-embedded images.
pub fn strip_data_uri_prefix(value: &str) -> String {
    match value.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest.to_string(),
        _ => value.to_string(),
    }
}
