//! Status-aware retry with decorrelated jitter (C2).
//!
//! Grounded on `app/services/reverse/utils/retry.py` / `app/services/grok/retry.py`
//! (`RetryContext`): wraps an async attempt function, classifies the error's
//! HTTP status, and sleeps with either `Retry-After`, decorrelated jitter
//! (429), or full-jitter exponential backoff (everything else retryable).

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::UpstreamError;

/// Retry engine configuration. Defaults mirror spec.md §6.4's pinned values.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retry: u32,
    pub retryable_status: HashSet<u16>,
    pub backoff_base: f64,
    pub backoff_factor: f64,
    pub backoff_max: f64,
    pub retry_budget: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retryable_status: [401, 429, 403].into_iter().collect(),
            backoff_base: 1.0,
            backoff_factor: 2.0,
            backoff_max: 30.0,
            retry_budget: 60.0,
        }
    }
}

impl RetryConfig {
    /// Builds a config that excludes 429 from the retryable set, for call
    /// sites (the chat entrypoint) where 429 must bubble up to cross-token
    /// fallover instead of being retried in place.
    pub fn without_429(&self) -> Self {
        let mut cfg = self.clone();
        cfg.retryable_status.remove(&429);
        cfg
    }
}

/// Mutable state threaded through retry attempts; `last_delay` persists the
/// decorrelated-jitter anchor across 429 retries.
struct RetryState {
    last_delay: f64,
    accumulated_delay: f64,
}

fn extract_retry_after(err: &UpstreamError) -> Option<u64> {
    err.retry_after
}

/// Decorrelated jitter for a 429 retry: `uniform(backoff_base, last_delay*3)`
/// clamped to `backoff_max`. `Retry-After`, when present, takes priority.
fn calculate_429_delay(cfg: &RetryConfig, state: &mut RetryState, retry_after: Option<u64>) -> f64 {
    if let Some(secs) = retry_after {
        return (secs as f64).min(cfg.backoff_max);
    }
    let lo = cfg.backoff_base;
    let hi = (state.last_delay * 3.0).max(lo);
    let delay = rand::thread_rng().gen_range(lo..=hi).min(cfg.backoff_max);
    state.last_delay = delay;
    delay
}

/// Runs `attempt` under the retry policy. `attempt_index` starts at 0 and is
/// used for full-jitter exponential scaling on non-429 retryable statuses.
pub async fn retry_on_status<T, Fut, F>(cfg: &RetryConfig, mut attempt: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut state = RetryState {
        last_delay: cfg.backoff_base,
        accumulated_delay: 0.0,
    };
    let mut attempt_index: u32 = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = cfg.retryable_status.contains(&err.status);
                if !retryable || attempt_index >= cfg.max_retry {
                    return Err(err);
                }
                let retry_after = extract_retry_after(&err);
                let delay = if retry_after.is_some() || err.status == 429 {
                    calculate_429_delay(cfg, &mut state, retry_after)
                } else {
                    let scaled = cfg.backoff_base * cfg.backoff_factor.powi(attempt_index as i32);
                    rand::thread_rng().gen_range(0.0..=scaled.min(cfg.backoff_max))
                };

                if state.accumulated_delay + delay > cfg.retry_budget {
                    return Err(err);
                }
                state.accumulated_delay += delay;
                attempt_index += 1;
                tracing::debug!(
                    event = "retry_sleep",
                    status = err.status,
                    delay_secs = delay,
                    attempt = attempt_index,
                    "retrying upstream call"
                );
                tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let cfg = RetryConfig::default();
        let result: Result<u32, UpstreamError> = retry_on_status(&cfg, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn non_retryable_status_reraises_immediately() {
        let cfg = RetryConfig::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, UpstreamError> = retry_on_status(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::new(400, "bad request")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_budget_exhausted_then_reraises_last_error() {
        let mut cfg = RetryConfig::default();
        cfg.backoff_base = 0.01;
        cfg.backoff_max = 0.02;
        cfg.retry_budget = 0.03;
        let calls = AtomicU32::new(0);
        let result: Result<u32, UpstreamError> = retry_on_status(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::new(500, "boom")) }
        })
        .await;
        assert!(result.is_err());
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn without_429_excludes_rate_limit_from_retry_set() {
        let cfg = RetryConfig::default().without_429();
        let calls = AtomicU32::new(0);
        let result: Result<u32, UpstreamError> = retry_on_status(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::new(429, "rate limited")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
