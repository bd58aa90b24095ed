//! Bounded exponential backoff for reconnect attempts.

use std::time::Duration;

/// Doubles from `base` on every consecutive failure, each delay capped at
/// `max_delay`. After `max_attempts` retries the policy gives up.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            max_attempts,
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` once the retry budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_attempts {
            return None;
        }
        let shift = (self.failures - 1).min(16);
        let delay = self.base.saturating_mul(1u32 << shift);
        Some(delay.min(self.max_delay))
    }

    /// Called on every successful connect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
