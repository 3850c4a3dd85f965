//! Retry policy for provider calls: capped exponential backoff plus jitter.

use std::time::Duration;

use rand::Rng;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per recipient, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Upper bound of the exponential part of the delay.
    pub backoff_cap: Duration,
    /// Upper bound of the uniform random delay added on top.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    /// Whether attempt number `attempt` (1-based, already made) may be followed by another.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Deterministic part of the delay before retry `retry` (0-indexed):
    /// `min(cap, base * 2^retry)`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }

    /// Full delay before retry `retry`, jitter included.
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.max_jitter)
        };
        self.base_delay(retry) + jitter
    }

    /// Sum of the deterministic delays a recipient can accumulate before giving up.
    pub fn worst_case_wait(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|retry| self.base_delay(retry))
            .sum()
    }
}
