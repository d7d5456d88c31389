//! Retry policy for transactional units of work.

use crate::config::RetryConfig;
use crate::error::DbError;
use std::time::Duration;

/// Decides whether a failed attempt is retried and how long to wait first.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total attempts allowed, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Whether attempt number `attempt` (1-based) that failed with `err`
    /// should be followed by another attempt.
    pub fn should_retry(&self, err: &DbError, attempt: u32) -> bool {
        attempt < self.max_attempts() && err.is_transient()
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
