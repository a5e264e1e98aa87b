//! Admin batch operations and the voice-token broker (C9, admin surface).
//!
//! Grounded on `src/jobs.rs`'s scheduled-job dispatch in the teacher
//! (kick off work, hand back a handle, let the caller poll/stream status)
//! generalized to C6's per-task event bus instead of a cron-style job id.

use std::sync::Arc;

use serde_json::json;

use crate::app::AppState;
use crate::asset_cache::MediaType;
use crate::batch::{run_bounded, BatchTask};
use crate::error::AppError;
use crate::openai::VoiceTokenResponse;

use super::common::{exhausted_error, pick_token, resolve_pool_name, upstream_to_app_error};

/// A birth date comfortably over any age-gate the upstream NSFW toggle
/// checks; the gateway brokers tokens for an operator's own pool, not
/// end-user identities, so a fixed value is sufficient (spec.md §4.9).
const NSFW_BIRTH_DATE: &str = "1990-01-01";

async fn spawn_batch<I, O, W, Fut>(state: &AppState, items: Vec<(String, I)>, worker: W) -> Arc<BatchTask>
where
    W: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<O, String>> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    let total = items.len();
    let task = state.batches.create(total).await;
    let concurrency = state.settings.performance.batch_max_concurrent();
    let batch_size = state.settings.performance.batch_batch_size();
    let cancel = task.cancel_flag();
    let runner_task = task.clone();
    let registry = state.batches.clone();

    tokio::spawn(async move {
        let results = run_bounded(items, concurrency, batch_size, &cancel, worker, {
            let task = runner_task.clone();
            move |_key, outcome| {
                let task = task.clone();
                let succeeded = outcome.ok;
                tokio::spawn(async move { task.record_item(succeeded).await });
            }
        })
        .await;

        if cancel.is_cancelled() {
            runner_task.finish_cancelled().await;
        } else {
            let ok = results.values().filter(|o| o.ok).count();
            let fail = results.len() - ok;
            runner_task.finish_done(json!({ "ok": ok, "fail": fail }), None).await;
        }
    });

    registry.schedule_reap(task.clone());
    task
}

pub async fn get_task(state: &AppState, task_id: &str) -> Option<Arc<BatchTask>> {
    state.batches.get(task_id).await
}

pub async fn cancel_task(state: &AppState, task_id: &str) -> bool {
    match state.batches.get(task_id).await {
        Some(task) => {
            task.cancel();
            true
        }
        None => false,
    }
}

/// Re-probes quota for each token and updates its pool record.
pub async fn refresh_tokens(state: AppState, tokens: Vec<String>) -> Arc<BatchTask> {
    let items: Vec<(String, String)> = tokens.into_iter().map(|t| (t.clone(), t)).collect();
    let worker_state = state.clone();
    spawn_batch(&state, items, move |token: String| {
        let state = worker_state.clone();
        async move {
            let pool = resolve_pool_name(&state, &token).await.ok_or_else(|| "token not found in any pool".to_string())?;
            state
                .token_pool
                .sync_usage(&pool, &token, state.usage_syncer.as_ref())
                .await
                .map(|_| ())
                .map_err(|err| err.to_string())
        }
    })
    .await
}

/// Runs the TOS-accept / birth-date / feature-control toggle sequence
/// against each token (spec.md §B.1).
pub async fn nsfw_enable(state: AppState, tokens: Vec<String>) -> Arc<BatchTask> {
    let items: Vec<(String, String)> = tokens.into_iter().map(|t| (t.clone(), t)).collect();
    let worker_state = state.clone();
    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let retry_cfg = state.retry_cfg.clone();
    spawn_batch(&state, items, move |token: String| {
        let state = worker_state.clone();
        let retry_cfg = retry_cfg.clone();
        async move {
            state
                .upstream
                .accept_tos(&token, dynamic_statsig, &retry_cfg)
                .await
                .map_err(|err| err.body)?;
            state
                .upstream
                .set_birth_date(&token, dynamic_statsig, &retry_cfg, NSFW_BIRTH_DATE)
                .await
                .map_err(|err| err.body)?;
            state
                .upstream
                .nsfw_enable(&token, dynamic_statsig, &retry_cfg)
                .await
                .map_err(|err| err.body)?;
            if let Some(pool) = resolve_pool_name(&state, &token).await {
                state.token_pool.add_tag(&pool, &token, "nsfw").await.map_err(|err| err.to_string())?;
            }
            Ok(())
        }
    })
    .await
}

/// Deletes every asset an operator's token owns in upstream storage, then
/// stamps `last_asset_clear_at` on the token record.
pub async fn cache_online_clear(state: AppState, tokens: Vec<String>) -> Arc<BatchTask> {
    let items: Vec<(String, String)> = tokens.into_iter().map(|t| (t.clone(), t)).collect();
    let worker_state = state.clone();
    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let retry_cfg = state.retry_cfg.clone();
    spawn_batch(&state, items, move |token: String| {
        let state = worker_state.clone();
        let retry_cfg = retry_cfg.clone();
        async move {
            let assets = state
                .upstream
                .list_assets(&token, dynamic_statsig, &retry_cfg)
                .await
                .map_err(|err| err.body)?;
            for asset in &assets {
                state
                    .upstream
                    .delete_asset(&token, dynamic_statsig, &retry_cfg, &asset.id)
                    .await
                    .map_err(|err| err.body)?;
            }
            if let Some(pool) = resolve_pool_name(&state, &token).await {
                state.token_pool.mark_asset_clear(&pool, &token).await.map_err(|err| err.to_string())?;
            }
            Ok(assets.len() as u32)
        }
    })
    .await
}

/// Pre-warms the local asset cache from each token's remote asset list.
pub async fn cache_online_load(state: AppState, tokens: Vec<String>) -> Arc<BatchTask> {
    let items: Vec<(String, String)> = tokens.into_iter().map(|t| (t.clone(), t)).collect();
    let worker_state = state.clone();
    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let retry_cfg = state.retry_cfg.clone();
    spawn_batch(&state, items, move |token: String| {
        let state = worker_state.clone();
        let retry_cfg = retry_cfg.clone();
        async move {
            let assets = state
                .upstream
                .list_assets(&token, dynamic_statsig, &retry_cfg)
                .await
                .map_err(|err| err.body)?;
            let mut loaded = 0u32;
            for asset in &assets {
                let Some(uri) = &asset.uri else { continue };
                let upstream = state.upstream.clone();
                let retry_cfg = retry_cfg.clone();
                let token = token.clone();
                let asset_path = uri.trim_start_matches('/').to_string();
                let downloader = move |dest: std::path::PathBuf| {
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
                if state.asset_cache.download(MediaType::Image, uri, downloader).await.is_ok() {
                    loaded += 1;
                }
            }
            Ok(loaded)
        }
    })
    .await
}

/// Brokers a LiveKit voice session token, picking a token the same way chat
/// does — basic pool first, falling back to super (spec.md §B.5).
pub async fn voice_token(state: AppState) -> Result<VoiceTokenResponse, AppError> {
    use crate::models::{POOL_BASIC, POOL_SUPER};
    let candidates = vec![POOL_BASIC.to_string(), POOL_SUPER.to_string()];
    let tried = Default::default();
    let Some(attempt) = pick_token(&state, &candidates, &tried).await else {
        return Err(exhausted_error());
    };
    let dynamic_statsig = state.settings.chat.dynamic_statsig();
    let broker = state
        .upstream
        .livekit_token(&attempt.token.token, dynamic_statsig, &state.retry_cfg)
        .await
        .map_err(upstream_to_app_error)?;

    Ok(VoiceTokenResponse {
        token: broker.token,
        url: "wss://livekit.grok.com",
        participant_name: format!("gateway-{}", uuid::Uuid::new_v4()),
        room_name: format!("voice-{}", uuid::Uuid::new_v4()),
    })
}
