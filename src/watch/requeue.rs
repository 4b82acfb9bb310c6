//! Per-key failure accounting for the work queue

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Delay before the first retry of a failed key
pub const REQUEUE_BASE_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on any retry delay
pub const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(300);

/// Counts consecutive failures per resource key.
///
/// A key is retried with a growing delay until it has failed
/// `max_requeues` times in a row; after that it is dropped until its object
/// changes again.
#[derive(Debug, Default)]
pub struct RequeueTracker {
    max_requeues: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl RequeueTracker {
    /// Tracker dropping keys after `max_requeues` consecutive failures
    pub fn new(max_requeues: u32) -> Self {
        Self {
            max_requeues,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure of `key`.
    ///
    /// Returns the delay before the next attempt, or `None` when the key has
    /// used up its requeues. A dropped key starts from zero next time.
    pub fn record_failure(&self, key: &str) -> Option<Duration> {
        let mut failures = self.failures();
        let count = failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count > self.max_requeues {
            failures.remove(key);
            return None;
        }
        let factor = 1u32 << (*count - 1).min(16);
        Some((REQUEUE_BASE_DELAY * factor).min(REQUEUE_MAX_DELAY))
    }

    /// Forget the failures of `key` after a successful reconcile
    pub fn reset(&self, key: &str) {
        self.failures().remove(key);
    }

    /// Consecutive failures currently recorded for `key`
    pub fn failures_of(&self, key: &str) -> u32 {
        self.failures().get(key).copied().unwrap_or(0)
    }
}
