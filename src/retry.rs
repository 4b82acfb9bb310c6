//! Retry policies for API calls that may fail transiently.
//!
//! Two loops share one [`RetryConfig`]:
//!
//! - [`retry_with_backoff`] retries any error (used for client calls whose
//!   failures are expected to clear up on their own).
//! - [`retry_on_conflict`] retries only optimistic-concurrency conflicts and
//!   reports exhaustion as [`Error::ReconcileExhausted`]. The closure gets the
//!   attempt number so it can reuse the object it already holds on the first
//!   attempt and re-read it afterwards.
//!
//! # Example
//!
//! ```ignore
//! use stash::retry::{retry_on_conflict, RetryConfig};
//!
//! let updated = retry_on_conflict(&RetryConfig::conflict(), "add sidecar", |attempt| async move {
//!     let mut obj = if attempt == 1 { seed.clone() } else { fetch().await? };
//!     mutate(&mut obj);
//!     replace(&obj).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Backoff policy for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure (1.0 = fixed delay)
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Policy for read-modify-write conflicts: 3 attempts, fixed 10ms apart
    pub fn conflict() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    fn delay_for(&self, delay: Duration) -> Duration {
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(delay.as_secs_f64() * factor)
        } else {
            delay
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
/// Returns the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let wait = config.delay_for(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Retry a read-modify-write operation while it keeps hitting conflicts.
///
/// Non-conflict errors are returned immediately. Running out of attempts on
/// a conflict yields [`Error::ReconcileExhausted`].
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() => {
                if config.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Conflict retries exhausted"
                    );
                    return Err(Error::ReconcileExhausted {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                    });
                }

                let wait = config.delay_for(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = wait.as_millis(),
                    "Object changed since read, re-reading"
                );

                tokio::time::sleep(wait).await;
                delay = config.next_delay(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: a conflicting writer wins twice, the third attempt lands
    #[tokio::test(start_paused = true)]
    async fn story_conflict_retry_rereads_and_succeeds() {
        let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = attempts.clone();

        let result = retry_on_conflict(&RetryConfig::conflict(), "patch", |attempt| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(attempt);
                if attempt < 3 {
                    Err(Error::conflict("resourceVersion changed"))
                } else {
                    Ok("patched")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "patched");
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
    }

    /// Story: a workload under constant churn exhausts the conflict ceiling
    #[tokio::test(start_paused = true)]
    async fn story_conflict_ceiling_surfaces_reconcile_exhausted() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> =
            retry_on_conflict(&RetryConfig::conflict(), "add sidecar", |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::conflict("stale"))
                }
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::ReconcileExhausted {
                operation,
                attempts,
            }) => {
                assert_eq!(operation, "add sidecar");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected ReconcileExhausted, got {other:?}"),
        }
    }

    /// Story: only conflicts are retried, anything else surfaces at once
    #[tokio::test(start_paused = true)]
    async fn story_non_conflict_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> =
            retry_on_conflict(&RetryConfig::conflict(), "status", |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::validation("bad spec"))
                }
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_conflict_policy_uses_fixed_delay() {
        let config = RetryConfig::conflict();
        let d = config.initial_delay;
        assert_eq!(config.next_delay(d), Duration::from_millis(10));
        assert_eq!(config.delay_for(d), Duration::from_millis(10));
    }
}
