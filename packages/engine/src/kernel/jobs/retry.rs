//! Retry policy: decides whether a failed job goes back to `pending`.

use std::time::Duration;

use super::job::ErrorKind;

/// What to do with a job whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        next_retry_count: i32,
        delay: Duration,
    },
    GiveUp,
}

/// Capped exponential backoff: `min(2^retry_count * base_delay, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Retry immediately; used by tests that drive the dispatcher by hand.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before the attempt that follows `retry_count` earlier retries.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn decide(&self, retry_count: i32, max_retries: i32, kind: ErrorKind) -> RetryDecision {
        if kind.should_retry() && retry_count < max_retries {
            RetryDecision::Retry {
                next_retry_count: retry_count + 1,
                delay: self.backoff(retry_count),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}
