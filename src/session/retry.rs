//! Exponential backoff for reconnection
//!
//! `delay = min(base * 2^attempt, max)` with no jitter, so reconnect timing is
//! reproducible in tests.

use std::time::Duration;

/// Reconnection backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: None,
        }
    }

    /// Cap the number of consecutive reattempts; `None` retries forever
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay before the reattempt following `attempt` consecutive failures
    ///
    /// `attempt` is zero-based. Overflow saturates to the maximum delay.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();

        let delay_ms = 2u128
            .checked_pow(attempt)
            .and_then(|factor| base_ms.checked_mul(factor))
            .map_or(max_ms, |ms| ms.min(max_ms));

        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    /// Decide what to do once the failure counter has reached `failures`
    ///
    /// The counter is 1 right after the first failed connect or lost link,
    /// which schedules the first reattempt at `next_delay(0)`.
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if let Some(max) = self.max_attempts {
            if failures > max {
                return RetryDecision::GiveUp { attempts: max };
            }
        }
        RetryDecision::Retry {
            attempt: failures,
            delay: self.next_delay(failures.saturating_sub(1)),
        }
    }
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule reattempt number `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
    /// The configured attempt budget is spent
    GiveUp { attempts: u32 },
}
