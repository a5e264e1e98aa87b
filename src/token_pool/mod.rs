//! Token Pool Manager (C3).
//!
//! Grounded on `app/services/grok/token.py`'s token manager operations
//! (`token_balancer`, `record_token_failure`, `reset_token_failure`),
//! generalized to the multi-pool, multi-field model of spec.md §3/§4.3, and
//! on `src/mcp_pool.rs`'s pattern of an `Arc<RwLock<...>>` map guarded for
//! readers-take-a-snapshot / writers-serialize-per-key access.

pub mod storage;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::sync::RwLock;

pub use storage::{FileStorageBackend, StorageBackend};
pub use types::{Effort, TokenInfo, TokenPool, TokenStatus, MAX_FAILURE_COUNT};

/// Interval after which a cooling token becomes eligible for a usage re-sync
/// (spec.md §4.3 `refresh_cooling_tokens`, default 8h).
const COOLING_REFRESH_INTERVAL_SECS: u64 = 8 * 3600;

/// Threshold past which the in-memory view is considered stale and reloaded
/// from storage (multi-process consistency, spec.md §4.3 `reload_if_stale`).
const STALE_THRESHOLD_SECS: u64 = 5;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_secs() -> u64 {
    now_ms() / 1000
}

/// Callback invoked to sync quota for a token against the upstream
/// rate-limits endpoint; supplied by the caller (C4's rate-limits probe) so
/// this module stays free of HTTP concerns.
#[async_trait::async_trait]
pub trait UsageSyncer: Send + Sync {
    async fn sync_usage(&self, token: &str) -> Result<u32>;
}

/// Singleton-shaped owner of all pools, with explicit load/save delegated to
/// a storage backend. Callers hold this behind an `Arc` and pass it through
/// request context rather than reaching for a process-wide global.
pub struct TokenPoolManager {
    pools: RwLock<HashMap<String, TokenPool>>,
    storage: Arc<dyn StorageBackend>,
    last_loaded_at: RwLock<u64>,
}

impl TokenPoolManager {
    pub async fn load(storage: Arc<dyn StorageBackend>) -> Result<Self> {
        let pools = storage.load_tokens().await?;
        Ok(Self {
            pools: RwLock::new(pools),
            storage,
            last_loaded_at: RwLock::new(now_secs()),
        })
    }

    pub async fn save(&self) -> Result<()> {
        let pools = self.pools.read().await;
        self.storage.save_tokens(&pools).await
    }

    /// Reloads from storage if the in-memory view is older than the stale
    /// threshold. Intended for multi-process deployments sharing one backend.
    pub async fn reload_if_stale(&self) -> Result<bool> {
        let age = now_secs().saturating_sub(*self.last_loaded_at.read().await);
        if age < STALE_THRESHOLD_SECS {
            return Ok(false);
        }
        let fresh = self.storage.load_tokens().await?;
        *self.pools.write().await = fresh;
        *self.last_loaded_at.write().await = now_secs();
        Ok(true)
    }

    /// First `active` token in insertion order not present in `exclude`.
    /// Never returns a `cooling`/`expired`/`disabled` token.
    pub async fn get_token(&self, pool: &str, exclude: &HashSet<String>) -> Option<TokenInfo> {
        let pools = self.pools.read().await;
        pools.get(pool).and_then(|p| {
            p.iter()
                .find(|t| t.status == TokenStatus::Active && !exclude.contains(&t.token))
                .cloned()
        })
    }

    /// Video-specific pick: `resolution == "720p"` or `length > 6` forces the
    /// super tier; otherwise prefer the basic tier, falling back to the other
    /// on a tier miss.
    pub async fn get_token_for_video(
        &self,
        resolution: &str,
        length_secs: u32,
        candidates: &[String],
        exclude: &HashSet<String>,
    ) -> Option<TokenInfo> {
        let requires_super = resolution == "720p" || length_secs > 6;
        let ordered: Vec<&String> = if requires_super {
            candidates.iter().rev().collect()
        } else {
            candidates.iter().collect()
        };
        for pool in ordered {
            if let Some(token) = self.get_token(pool, exclude).await {
                return Some(token);
            }
        }
        None
    }

    /// Decrements `quota` by `effort`'s cost, clamped at 0; recomputes state.
    /// Does not clear `fail_count` (spec.md §9 Open Question: kept verbatim).
    pub async fn consume(&self, pool: &str, token: &str, effort: Effort) -> Result<u32> {
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("consume: token not found in pool {pool}");
        };
        let cost = effort.cost();
        let actual = cost.min(info.quota);
        info.quota -= actual;
        info.use_count += 1;
        info.last_used_at = Some(now_ms());
        info.recompute_state();
        drop(pools);
        self.save().await?;
        Ok(actual)
    }

    /// 401 increments `fail_count`; at `MAX_FAILURE_COUNT` the token expires.
    /// Non-401 statuses are not counted against `fail_count`.
    pub async fn record_fail(&self, pool: &str, token: &str, status: u16, reason: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("record_fail: token not found in pool {pool}");
        };
        info.last_fail_at = Some(now_ms());
        info.last_fail_reason = Some(reason.to_string());
        if status == 401 {
            info.fail_count += 1;
            if info.fail_count >= MAX_FAILURE_COUNT {
                info.status = TokenStatus::Expired;
            }
        }
        drop(pools);
        self.save().await?;
        Ok(())
    }

    /// Clears failure tracking; on `is_usage`, bumps `use_count`/`last_used_at`.
    pub async fn record_success(&self, pool: &str, token: &str, is_usage: bool) -> Result<()> {
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("record_success: token not found in pool {pool}");
        };
        info.fail_count = 0;
        info.last_fail_reason = None;
        if is_usage {
            info.use_count += 1;
            info.last_used_at = Some(now_ms());
        }
        info.recompute_state();
        drop(pools);
        self.save().await?;
        Ok(())
    }

    /// Marks a token `cooling` after a 429; does not touch `fail_count`.
    pub async fn mark_rate_limited(&self, pool: &str, token: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("mark_rate_limited: token not found in pool {pool}");
        };
        info.status = TokenStatus::Cooling;
        drop(pools);
        self.save().await?;
        Ok(())
    }

    /// Queries the upstream rate-limits endpoint via `syncer`, updates quota,
    /// recomputes state, stamps `last_sync_at`.
    pub async fn sync_usage(
        &self,
        pool: &str,
        token: &str,
        syncer: &dyn UsageSyncer,
    ) -> Result<u32> {
        let quota = syncer.sync_usage(token).await?;
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("sync_usage: token not found in pool {pool}");
        };
        info.quota = quota;
        info.last_sync_at = Some(now_ms());
        info.recompute_state();
        drop(pools);
        self.save().await?;
        Ok(quota)
    }

    /// Iterates cooling tokens whose `last_sync_at` predates the refresh
    /// interval, syncs each, and returns the count recovered to `active`.
    pub async fn refresh_cooling_tokens(&self, syncer: &dyn UsageSyncer) -> Result<u32> {
        let stale_cutoff = now_ms().saturating_sub(COOLING_REFRESH_INTERVAL_SECS * 1000);
        let candidates: Vec<(String, String)> = {
            let pools = self.pools.read().await;
            pools
                .iter()
                .flat_map(|(pool_name, pool)| {
                    pool.iter()
                        .filter(|t| {
                            t.status == TokenStatus::Cooling
                                && t.last_sync_at.is_none_or(|ts| ts < stale_cutoff)
                        })
                        .map(|t| (pool_name.clone(), t.token.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut recovered = 0;
        for (pool, token) in candidates {
            if let Ok(quota) = self.sync_usage(&pool, &token, syncer).await {
                if quota > 0 {
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    pub async fn add_tag(&self, pool: &str, token: &str, tag: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("add_tag: token not found in pool {pool}");
        };
        info.tags.insert(tag.to_string());
        drop(pools);
        self.save().await?;
        Ok(())
    }

    pub async fn mark_asset_clear(&self, pool: &str, token: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("mark_asset_clear: token not found in pool {pool}");
        };
        info.last_asset_clear_at = Some(now_ms());
        drop(pools);
        self.save().await?;
        Ok(())
    }

    /// Admin import: inserts a new token record into a pool, creating the
    /// pool if absent.
    pub async fn import_token(&self, pool: &str, token: &str, quota: u32) -> Result<()> {
        let mut pools = self.pools.write().await;
        let entry = pools.entry(pool.to_string()).or_default();
        if entry.iter().any(|t| t.token == token) {
            anyhow::bail!("import_token: token already present in pool {pool}");
        }
        entry.insert(TokenInfo::new(token, quota, now_ms()));
        drop(pools);
        self.save().await
    }

    /// Admin removal.
    pub async fn remove_token(&self, pool: &str, token: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        if let Some(p) = pools.get_mut(pool) {
            p.remove(token);
        }
        drop(pools);
        self.save().await
    }

    /// Admin reset: the only path back from `expired`.
    pub async fn reset_token(&self, pool: &str, token: &str, quota: u32) -> Result<()> {
        let mut pools = self.pools.write().await;
        let Some(info) = pools.get_mut(pool).and_then(|p| p.get_mut(token)) else {
            anyhow::bail!("reset_token: token not found in pool {pool}");
        };
        info.status = TokenStatus::Active;
        info.quota = quota;
        info.fail_count = 0;
        info.last_fail_reason = None;
        drop(pools);
        self.save().await
    }

    /// Snapshot of all pools for admin listing / batch enumeration.
    pub async fn snapshot(&self) -> HashMap<String, Vec<TokenInfo>> {
        let pools = self.pools.read().await;
        pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.iter().cloned().collect()))
            .collect()
    }

    pub async fn acquire_save_lock(&self, timeout: Duration) -> Result<storage::LockGuard> {
        self.storage.acquire_lock("token_pool_save", timeout).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct FixedSyncer(u32);
    #[async_trait::async_trait]
    impl UsageSyncer for FixedSyncer {
        async fn sync_usage(&self, _token: &str) -> Result<u32> {
            Ok(self.0)
        }
    }

    async fn manager_with_token(quota: u32) -> (TokenPoolManager, String) {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileStorageBackend::new(dir.path().to_path_buf()));
        let mgr = TokenPoolManager::load(backend).await.unwrap();
        mgr.import_token("ssoBasic", "T1", quota).await.unwrap();
        (mgr, "T1".to_string())
    }

    #[tokio::test]
    async fn get_token_never_returns_excluded() {
        let (mgr, token) = manager_with_token(80).await;
        let mut exclude = HashSet::new();
        exclude.insert(token.clone());
        assert!(mgr.get_token("ssoBasic", &exclude).await.is_none());
        assert!(mgr.get_token("ssoBasic", &HashSet::new()).await.is_some());
    }

    #[tokio::test]
    async fn consume_decrements_and_transitions_to_cooling_at_zero() {
        let (mgr, token) = manager_with_token(1).await;
        let actual = mgr.consume("ssoBasic", &token, Effort::Low).await.unwrap();
        assert_eq!(actual, 1);
        let snap = mgr.snapshot().await;
        let info = &snap["ssoBasic"][0];
        assert_eq!(info.quota, 0);
        assert_eq!(info.status, TokenStatus::Cooling);
    }

    #[tokio::test]
    async fn consume_clamps_at_zero_and_does_not_clear_fail_count() {
        let (mgr, token) = manager_with_token(1).await;
        mgr.record_fail("ssoBasic", &token, 401, "unauthorized").await.unwrap();
        mgr.consume("ssoBasic", &token, Effort::High).await.unwrap();
        let snap = mgr.snapshot().await;
        let info = &snap["ssoBasic"][0];
        assert_eq!(info.quota, 0);
        assert_eq!(info.fail_count, 1);
    }

    #[tokio::test]
    async fn five_consecutive_401s_expire_the_token() {
        let (mgr, token) = manager_with_token(80).await;
        for _ in 0..5 {
            mgr.record_fail("ssoBasic", &token, 401, "unauthorized").await.unwrap();
        }
        let snap = mgr.snapshot().await;
        assert_eq!(snap["ssoBasic"][0].status, TokenStatus::Expired);
        assert!(mgr.get_token("ssoBasic", &HashSet::new()).await.is_none());
    }

    #[tokio::test]
    async fn non_401_failures_do_not_increment_fail_count() {
        let (mgr, token) = manager_with_token(80).await;
        mgr.record_fail("ssoBasic", &token, 500, "server error").await.unwrap();
        let snap = mgr.snapshot().await;
        assert_eq!(snap["ssoBasic"][0].fail_count, 0);
    }

    #[tokio::test]
    async fn rate_limited_then_synced_quota_becomes_active() {
        let (mgr, token) = manager_with_token(1).await;
        mgr.mark_rate_limited("ssoBasic", &token).await.unwrap();
        let snap = mgr.snapshot().await;
        assert_eq!(snap["ssoBasic"][0].status, TokenStatus::Cooling);

        mgr.sync_usage("ssoBasic", &token, &FixedSyncer(50)).await.unwrap();
        let snap = mgr.snapshot().await;
        assert_eq!(snap["ssoBasic"][0].status, TokenStatus::Active);
        assert_eq!(snap["ssoBasic"][0].quota, 50);
    }

    #[tokio::test]
    async fn reset_token_clears_expired_state() {
        let (mgr, token) = manager_with_token(80).await;
        for _ in 0..5 {
            mgr.record_fail("ssoBasic", &token, 401, "unauthorized").await.unwrap();
        }
        mgr.reset_token("ssoBasic", &token, 100).await.unwrap();
        let snap = mgr.snapshot().await;
        let info = &snap["ssoBasic"][0];
        assert_eq!(info.status, TokenStatus::Active);
        assert_eq!(info.quota, 100);
        assert_eq!(info.fail_count, 0);
    }
}
