//! Composition root (C9 collaborators): wires settings, model table, token
//! pool, upstream client, asset cache and batch registry into the single
//! shared handle the gateway router and entrypoints close over.
//!
//! Grounded on `src/agent.rs`'s `Agent` struct in the teacher, which played
//! the same role (one `Arc`-wrapped state bag built once at startup and
//! cloned into every request handler).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::asset_cache::AssetCache;
use crate::config::GatewaySettings;
use crate::error::UpstreamError;
use crate::models::ModelTable;
use crate::retry::RetryConfig;
use crate::token_pool::storage::FileStorageBackend;
use crate::token_pool::{TokenPoolManager, UsageSyncer};
use crate::upstream::proxy_pool::ProxyPool;
use crate::upstream::UpstreamClient;
use crate::batch::BatchRegistry;

/// Probes the quota remaining for one token, wired to `refresh_cooling_tokens`
/// and to the admin-triggered "refresh" batch op.
///
/// `UsageSyncer::sync_usage` only carries a token, not a pool or model name,
/// so this syncer probes with a fixed `request_kind`/`model_name` pair that
/// exercises the cheapest rate-limit bucket every pool shares (decision
/// recorded in DESIGN.md).
pub struct RateLimitSyncer {
    upstream: Arc<UpstreamClient>,
    retry_cfg: RetryConfig,
    dynamic_statsig: bool,
    request_kind: &'static str,
    model_name: &'static str,
}

impl RateLimitSyncer {
    pub fn new(upstream: Arc<UpstreamClient>, retry_cfg: RetryConfig, dynamic_statsig: bool) -> Self {
        Self {
            upstream,
            retry_cfg,
            dynamic_statsig,
            request_kind: "DEFAULT",
            model_name: "grok-4-fast",
        }
    }
}

#[async_trait]
impl UsageSyncer for RateLimitSyncer {
    async fn sync_usage(&self, token: &str) -> anyhow::Result<u32> {
        let probe = self
            .upstream
            .rate_limits_probe(token, self.dynamic_statsig, &self.retry_cfg, self.request_kind, self.model_name)
            .await?;
        Ok(probe.remaining_queries)
    }
}

impl From<UpstreamError> for anyhow::Error {
    fn from(err: UpstreamError) -> Self {
        anyhow::anyhow!("{}: {}", err.status, err.body)
    }
}

pub struct AppStateInner {
    pub settings: GatewaySettings,
    pub models: ModelTable,
    pub token_pool: Arc<TokenPoolManager>,
    pub upstream: Arc<UpstreamClient>,
    pub asset_cache: Arc<AssetCache>,
    pub batches: Arc<BatchRegistry>,
    pub retry_cfg: RetryConfig,
    pub usage_syncer: Arc<RateLimitSyncer>,
}

pub type AppState = Arc<AppStateInner>;

/// Builds the full collaborator graph from loaded settings. Separated from
/// `main` so integration tests can build a state handle against a temp
/// `data_dir` without going through the CLI.
pub async fn bootstrap(settings: GatewaySettings) -> anyhow::Result<AppState> {
    let models = crate::config::load_model_table_file(&models_file_path(&settings));

    let data_dir: PathBuf = settings.app.data_dir();
    tokio::fs::create_dir_all(&data_dir).await.ok();

    let storage = Arc::new(FileStorageBackend::new(data_dir.clone()));
    let token_pool = Arc::new(TokenPoolManager::load(storage).await?);

    let proxies = settings.network.proxies.clone().unwrap_or_default();
    let proxy_pool = Arc::new(ProxyPool::new(proxies));
    let upstream = Arc::new(UpstreamClient::new(&settings.network, &settings.security, proxy_pool)?);

    let retry_cfg = settings.retry.to_retry_config();
    let usage_syncer = Arc::new(RateLimitSyncer::new(
        upstream.clone(),
        retry_cfg.clone(),
        settings.chat.dynamic_statsig(),
    ));

    let asset_cache = Arc::new(AssetCache::new(
        data_dir.join("assets"),
        settings.image.cache_max_size_mb(),
        settings.image.video_cache_max_size_mb(),
    ));

    let batches = BatchRegistry::new();

    Ok(Arc::new(AppStateInner {
        settings,
        models,
        token_pool,
        upstream,
        asset_cache,
        batches,
        retry_cfg,
        usage_syncer,
    }))
}

fn models_file_path(settings: &GatewaySettings) -> PathBuf {
    settings.app.data_dir().join("models.toml")
}

/// Periodic background sweep reloading stale token pools and refreshing
/// cooling tokens, run as a detached task from `main` (spec.md §4.3 cadence).
const BACKGROUND_REFRESH_INTERVAL_SECS: u64 = 60;

pub fn spawn_background_refresh(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(BACKGROUND_REFRESH_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = state.token_pool.reload_if_stale().await {
                tracing::warn!(event = "token_pool_reload_failed", error = %err);
            }
            if let Err(err) = state.token_pool.refresh_cooling_tokens(state.usage_syncer.as_ref()).await {
                tracing::warn!(event = "cooling_refresh_failed", error = %err);
            }
        }
    });
}
