//! Persistence backend contract (§6.3) plus a file-backed default impl.
//!
//! Grounded on `src/session/store.rs`'s shape (a store that delegates to an
//! optional backend collaborator behind a trait boundary, read/write guarded
//! by an async lock) generalized from "Valkey-or-memory" to the spec's
//! `{load_tokens, save_tokens, load_config, save_config, acquire_lock}`
//! contract. The teacher's concrete backend used `redis`; this crate has no
//! product need for a network KV store (tokens/config are small, local, and
//! persistence is explicitly "delegated" per spec.md's Non-goals), so the
//! default backend here is a local JSON file guarded by an in-process named
//! lock — the `redis` dependency is dropped (see DESIGN.md).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::types::TokenPool;

/// Storage contract any persistence backend must satisfy.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn load_tokens(&self) -> Result<HashMap<String, TokenPool>>;
    async fn save_tokens(&self, pools: &HashMap<String, TokenPool>) -> Result<()>;
    async fn load_config(&self) -> Result<serde_json::Value>;
    async fn save_config(&self, config: &serde_json::Value) -> Result<()>;
    /// Acquires a named mutual-exclusion lock, failing if not obtained
    /// within `timeout`. Scoped per-process; cross-process coordination is
    /// this backend's responsibility (spec.md §6.3).
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard>;
}

/// Released on drop.
pub struct LockGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokensFile {
    pools: HashMap<String, TokenPool>,
}

/// Local JSON-file-backed storage. Last-writer-wins on `save_*`.
pub struct FileStorageBackend {
    tokens_path: PathBuf,
    config_path: PathBuf,
    write_lock: Mutex<()>,
    named_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStorageBackend {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            tokens_path: data_dir.join("tokens.json"),
            config_path: data_dir.join("config.json"),
            write_lock: Mutex::new(()),
            named_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn named_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.named_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl StorageBackend for FileStorageBackend {
    async fn load_tokens(&self) -> Result<HashMap<String, TokenPool>> {
        match tokio::fs::read(&self.tokens_path).await {
            Ok(bytes) => {
                let file: TokensFile = serde_json::from_slice(&bytes)
                    .context("failed to parse tokens.json")?;
                Ok(file.pools)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err).context("failed to read tokens.json"),
        }
    }

    async fn save_tokens(&self, pools: &HashMap<String, TokenPool>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.tokens_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let file = TokensFile {
            pools: pools.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("failed to serialize tokens")?;
        let tmp_path = self.tokens_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .context("failed to write tokens.json.tmp")?;
        tokio::fs::rename(&tmp_path, &self.tokens_path)
            .await
            .context("failed to rename tokens.json.tmp")?;
        Ok(())
    }

    async fn load_config(&self) -> Result<serde_json::Value> {
        match tokio::fs::read(&self.config_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).context("failed to parse config.json")?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::json!({})),
            Err(err) => Err(err).context("failed to read config.json"),
        }
    }

    async fn save_config(&self, config: &serde_json::Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let bytes = serde_json::to_vec_pretty(config).context("failed to serialize config")?;
        tokio::fs::write(&self.config_path, bytes)
            .await
            .context("failed to write config.json")?;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let lock = self.named_lock(name).await;
        let permit = tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| anyhow::anyhow!("acquire_lock({name}) timed out after {timeout:?}"))?;
        Ok(LockGuard { _permit: permit })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::token_pool::types::{Effort, TokenInfo};

    #[tokio::test]
    async fn round_trips_tokens_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        let mut pool = TokenPool::default();
        pool.insert(TokenInfo::new("t1", 80, 0));
        let mut pools = HashMap::new();
        pools.insert("ssoBasic".to_string(), pool);

        backend.save_tokens(&pools).await.unwrap();
        let loaded = backend.load_tokens().await.unwrap();
        assert_eq!(loaded["ssoBasic"].len(), 1);
        let _ = Effort::Low.cost();
    }

    #[tokio::test]
    async fn acquire_lock_serializes_named_access() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStorageBackend::new(dir.path());
        let guard = backend.acquire_lock("pool", Duration::from_millis(50)).await.unwrap();
        let result = backend.acquire_lock("pool", Duration::from_millis(50)).await;
        assert!(result.is_err());
        drop(guard);
        assert!(backend.acquire_lock("pool", Duration::from_millis(50)).await.is_ok());
    }
}
