//! Bounded concurrent runner (spec.md §4.6): drives a list of items through
//! a worker function, limited by a concurrency semaphore and processed in
//! fixed-size batches so the cancellation flag is re-checked between them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;

/// Per-item result: either `data` or `error`, never both.
#[derive(Debug, Clone)]
pub struct ItemOutcome<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ItemOutcome<T> {
    fn success(data: T) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }

    fn failure(error: String) -> Self {
        Self { ok: false, data: None, error: Some(error) }
    }
}

/// Cooperative cancellation flag shared between an entrypoint and the
/// runner it spawned; `cancel()` is advisory (spec.md §5): in-flight items
/// finish, subsequent items are skipped.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs `items` through `worker`, bounded to `concurrency` in-flight tasks
/// and processed in chunks of `batch_size`. A single item failing does not
/// abort the batch. `on_item` fires once per completed item, in completion
/// order, so the caller can raise a `progress` event per item.
pub async fn run_bounded<I, O, W, Fut>(
    items: Vec<(String, I)>,
    concurrency: usize,
    batch_size: usize,
    cancel: &CancelFlag,
    worker: W,
    mut on_item: impl FnMut(&str, &ItemOutcome<O>),
) -> HashMap<String, ItemOutcome<O>>
where
    W: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, String>> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    let worker = Arc::new(worker);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let batch_size = batch_size.max(1);
    let mut results = HashMap::with_capacity(items.len());
    let mut remaining = items;

    while !remaining.is_empty() {
        if cancel.is_cancelled() {
            break;
        }
        let take = batch_size.min(remaining.len());
        let chunk: Vec<(String, I)> = remaining.drain(0..take).collect();

        let mut handles = Vec::with_capacity(chunk.len());
        for (key, item) in chunk {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = worker.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                worker(item).await
            });
            handles.push((key, handle));
        }

        for (key, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(data)) => ItemOutcome::success(data),
                Ok(Err(error)) => ItemOutcome::failure(error),
                Err(join_error) => ItemOutcome::failure(format!("worker task panicked: {join_error}")),
            };
            on_item(&key, &outcome);
            results.insert(key, outcome);
        }
    }

    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn single_item_failure_does_not_abort_batch() {
        let items = vec![
            ("a".to_string(), 1),
            ("b".to_string(), 0),
            ("c".to_string(), 3),
        ];
        let cancel = CancelFlag::new();
        let results = run_bounded(
            items,
            2,
            10,
            &cancel,
            |n: i32| async move {
                if n == 0 {
                    Err("zero not allowed".to_string())
                } else {
                    Ok(n * 10)
                }
            },
            |_, _| {},
        )
        .await;
        assert!(results["a"].ok);
        assert_eq!(results["a"].data, Some(10));
        assert!(!results["b"].ok);
        assert_eq!(results["b"].error.as_deref(), Some("zero not allowed"));
        assert!(results["c"].ok);
    }

    #[tokio::test]
    async fn cancellation_skips_items_not_yet_started() {
        let items: Vec<(String, i32)> = (0..10).map(|i| (i.to_string(), i)).collect();
        let cancel = Arc::new(CancelFlag::new());
        let processed = Arc::new(AtomicUsize::new(0));
        let cancel_for_worker = cancel.clone();
        let processed_for_worker = processed.clone();
        let results = run_bounded(
            items,
            1,
            1,
            &cancel,
            move |n: i32| {
                let cancel = cancel_for_worker.clone();
                let processed = processed_for_worker.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    if n == 2 {
                        cancel.cancel();
                    }
                    Ok::<i32, String>(n)
                }
            },
            |_, _| {},
        )
        .await;
        assert!(results.len() < 10);
    }

    #[tokio::test]
    async fn concurrency_cap_limits_in_flight_work() {
        let items: Vec<(String, i32)> = (0..6).map(|i| (i.to_string(), i)).collect();
        let cancel = CancelFlag::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let in_flight_for_worker = in_flight.clone();
        let max_seen_for_worker = max_seen.clone();
        let _ = run_bounded(
            items,
            2,
            6,
            &cancel,
            move |n: i32| {
                let in_flight = in_flight_for_worker.clone();
                let max_seen = max_seen_for_worker.clone();
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<i32, String>(n)
                }
            },
            |_, _| {},
        )
        .await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
