//! Task registry (spec.md §4.6): process-global map from task id to
//! [`BatchTask`], with a 300s post-terminal reap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::task::BatchTask;

const REAP_DELAY_SECS: u64 = 300;

#[derive(Default)]
pub struct BatchRegistry {
    tasks: RwLock<HashMap<String, Arc<BatchTask>>>,
}

impl BatchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates and registers a new task with `total` items.
    pub async fn create(&self, total: usize) -> Arc<BatchTask> {
        let id = Uuid::new_v4().to_string();
        let task = BatchTask::new(id.clone(), total);
        self.tasks.write().await.insert(id, task.clone());
        task
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<BatchTask>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Spawns a background waiter that removes `task` from the registry
    /// 300 seconds after it reaches a terminal state. The caller typically
    /// invokes this right after spawning the task's runner.
    pub fn schedule_reap(self: &Arc<Self>, task: Arc<BatchTask>) {
        let registry = self.clone();
        tokio::spawn(async move {
            task.wait_for_terminal().await;
            tokio::time::sleep(Duration::from_secs(REAP_DELAY_SECS)).await;
            registry.tasks.write().await.remove(&task.id);
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let registry = BatchRegistry::new();
        let task = registry.create(5).await;
        let fetched = registry.get(&task.id).await;
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn unknown_task_id_returns_none() {
        let registry = BatchRegistry::new();
        assert!(registry.get("missing").await.is_none());
    }
}
