//! Exponential backoff between upload attempts.

use rand::Rng;
use std::time::Duration;

use crate::config::ReconcilerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&ReconcilerConfig> for RetryPolicy {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retry_count` failures.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }

    /// `min(initial * 2^(retry - 1), max)` for the `retry`-th retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Backoff plus up to 10% random jitter, still capped at `max_backoff`.
    pub fn backoff_with_jitter(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        (base + random_jitter(base / 10)).min(self.max_backoff.max(base))
    }
}

/// Random duration in `[0, max)`.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_ms))
    } else {
        Duration::ZERO
    }
}
