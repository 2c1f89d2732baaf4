//! Reconnect backoff for the uplink.
//!
//! Formula: min(max_interval, 50ms * 2^attempt), with attempt 0 mapping to
//! the 50ms base. No jitter: one node holds one uplink.

use std::time::Duration;

/// Base delay before the first reconnect.
pub const BASE_DELAY: Duration = Duration::from_millis(50);

/// Exponential reconnect policy with an optional retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Upper bound for a single delay.
    pub max_interval: Duration,
    /// Maximum number of consecutive failed attempts (0 = unlimited).
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_secs(5),
            max_retries: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy.
    pub fn new(max_interval: Duration, max_retries: u32) -> Self {
        Self {
            max_interval,
            max_retries,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    ///
    /// Returns `None` once the retry budget is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_retries != 0 && attempt > self.max_retries {
            return None;
        }
        Some(self.backoff(attempt))
    }

    /// Uncapped-by-budget backoff for `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        BASE_DELAY
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}
