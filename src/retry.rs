//! Retry backoff policy for failed sync jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::{SyncError, SyncErrorKind};

/// Exponential backoff with a cap: `backoff(n) = min(base * 2^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in seconds
    pub base_seconds: u64,
    /// Upper bound on any single delay
    pub max_seconds: u64,
    /// Attempts after which a retryable failure is dead-lettered
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 15,
            max_seconds: 3600,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt once `attempt_count` attempts have failed.
    ///
    /// Non-decreasing in `attempt_count` and never above `max_seconds`.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
        let seconds = self.base_seconds.saturating_mul(factor).min(self.max_seconds);
        Duration::from_secs(seconds)
    }

    /// Delay for a specific failure. A remote `Retry-After` hint wins when it
    /// asks for a longer wait than the computed backoff.
    pub fn delay_for(&self, error: &SyncError, attempt_count: u32) -> Duration {
        let backoff = self.backoff(attempt_count);
        match error.kind {
            SyncErrorKind::RateLimited {
                retry_after_secs: Some(retry_after),
            } => backoff.max(Duration::from_secs(retry_after)),
            _ => backoff,
        }
    }

    /// Whether another attempt is allowed after `attempt_count` failures.
    pub fn has_budget(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}
