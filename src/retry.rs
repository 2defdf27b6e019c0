use std::time::Duration;

use crate::config::Extract;

/// Bounded retry budget with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(extract: &Extract) -> Self {
        Self {
            max_attempts: extract.max_attempts,
            initial_backoff: Duration::from_secs(extract.initial_backoff_seconds),
            max_backoff: Duration::from_secs(extract.max_backoff_seconds),
        }
    }

    /// `min(initial * 2^attempt, max)`, where `attempt` is zero-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
