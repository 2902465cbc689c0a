//! Retry policy for chunk uploads

use std::time::Duration;

use crate::upload::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS};

/// Exponential backoff without jitter: attempt `n` waits `base_delay * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a chunk gets `max_retries + 1` tries
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay }
    }

    /// Wait after failed attempt `attempt` (0-based) before the next one
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another attempt follows failed attempt `attempt`
    pub fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
