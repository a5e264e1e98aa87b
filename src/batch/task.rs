//! Per-task event bus (spec.md §4.6): subscribers attach a bounded,
//! drop-on-full queue and receive `progress`/`done`/`error`/`cancelled`
//! events; a late subscriber gets a counters snapshot plus the stored
//! terminal event, then the stream closes.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use super::runner::CancelFlag;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BatchEvent {
    #[serde(rename = "progress")]
    Progress { processed: usize, ok: usize, fail: usize, total: usize },
    #[serde(rename = "done")]
    Done {
        result: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    #[serde(rename = "error")]
    Error { error: String },
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl BatchEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, BatchEvent::Progress { .. })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    processed: usize,
    ok: usize,
    fail: usize,
    total: usize,
}

pub struct BatchTask {
    pub id: String,
    cancel: Arc<CancelFlag>,
    counters: Mutex<Counters>,
    subscribers: Mutex<Vec<mpsc::Sender<BatchEvent>>>,
    terminal: RwLock<Option<BatchEvent>>,
    terminal_notify: Notify,
}

impl BatchTask {
    pub(super) fn new(id: String, total: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            cancel: Arc::new(CancelFlag::new()),
            counters: Mutex::new(Counters { total, ..Counters::default() }),
            subscribers: Mutex::new(Vec::new()),
            terminal: RwLock::new(None),
            terminal_notify: Notify::new(),
        })
    }

    pub fn cancel_flag(&self) -> Arc<CancelFlag> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Attaches a new subscriber. If the task already reached a terminal
    /// state, the returned receiver yields a counters snapshot followed by
    /// the stored terminal event and then closes.
    pub async fn attach(&self) -> mpsc::Receiver<BatchEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let terminal = self.terminal.read().await.clone();
        match terminal {
            Some(event) => {
                let snapshot = self.progress_event().await;
                let _ = tx.send(snapshot).await;
                let _ = tx.send(event).await;
            }
            None => {
                self.subscribers.lock().await.push(tx);
            }
        }
        rx
    }

    async fn progress_event(&self) -> BatchEvent {
        let counters = *self.counters.lock().await;
        BatchEvent::Progress {
            processed: counters.processed,
            ok: counters.ok,
            fail: counters.fail,
            total: counters.total,
        }
    }

    /// Records one completed item and broadcasts the resulting `progress`
    /// event (spec.md §5: `progress` event count equals `processed`).
    pub async fn record_item(&self, succeeded: bool) {
        let event = {
            let mut counters = self.counters.lock().await;
            counters.processed += 1;
            if succeeded {
                counters.ok += 1;
            } else {
                counters.fail += 1;
            }
            BatchEvent::Progress {
                processed: counters.processed,
                ok: counters.ok,
                fail: counters.fail,
                total: counters.total,
            }
        };
        self.publish(event).await;
    }

    pub async fn finish_done(&self, result: serde_json::Value, warning: Option<String>) {
        self.publish(BatchEvent::Done { result, warning }).await;
    }

    pub async fn finish_error(&self, error: impl Into<String>) {
        self.publish(BatchEvent::Error { error: error.into() }).await;
    }

    pub async fn finish_cancelled(&self) {
        self.publish(BatchEvent::Cancelled).await;
    }

    async fn publish(&self, event: BatchEvent) {
        if event.is_terminal() {
            *self.terminal.write().await = Some(event.clone());
        }
        {
            let subscribers = self.subscribers.lock().await;
            for subscriber in subscribers.iter() {
                let _ = subscriber.try_send(event.clone());
            }
        }
        if event.is_terminal() {
            self.terminal_notify.notify_waiters();
            self.terminal_notify.notify_one();
        }
    }

    /// Resolves once this task reaches a terminal state. Used by the
    /// registry to schedule the 300s post-terminal reap.
    pub async fn wait_for_terminal(&self) {
        loop {
            if self.terminal.read().await.is_some() {
                return;
            }
            self.terminal_notify.notified().await;
        }
    }

    pub async fn is_terminal(&self) -> bool {
        self.terminal.read().await.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_events_count_matches_processed_items() {
        let task = BatchTask::new("t1".into(), 3);
        let mut rx = task.attach().await;
        task.record_item(true).await;
        task.record_item(false).await;
        task.finish_done(serde_json::json!({"n": 2}), None).await;

        let first = rx.recv().await.unwrap();
        match first {
            BatchEvent::Progress { processed, ok, fail, total } => {
                assert_eq!((processed, ok, fail, total), (1, 1, 0, 3));
            }
            other => panic!("unexpected: {other:?}"),
        }
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, BatchEvent::Progress { processed: 2, ok: 1, fail: 1, .. }));
        let third = rx.recv().await.unwrap();
        assert!(matches!(third, BatchEvent::Done { .. }));
    }

    #[tokio::test]
    async fn late_subscriber_gets_snapshot_then_terminal_then_closes() {
        let task = BatchTask::new("t1".into(), 1);
        task.record_item(true).await;
        task.finish_done(serde_json::json!({}), None).await;

        let mut rx = task.attach().await;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, BatchEvent::Progress { processed: 1, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, BatchEvent::Done { .. }));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn wait_for_terminal_resolves_after_finish() {
        let task = BatchTask::new("t1".into(), 1);
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.wait_for_terminal().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        task.finish_cancelled().await;
        waiter.await.unwrap();
        assert!(task.is_terminal().await);
    }
}
