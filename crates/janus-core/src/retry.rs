//! Bounded retry policy for socket reads.

use std::time::Duration;

/// Escalating timeout schedule for blocking reads.
///
/// Attempt `n` (zero-based) waits `base * multiplier^n`. One policy value is
/// threaded through configuration to every call site that waits on a slow
/// peer: keep-alive idle probing, slow-server header reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Timeout of the first attempt.
    pub base: Duration,
    /// Factor applied per subsequent attempt.
    pub multiplier: u32,
    /// Total number of attempts before the wait is treated as fatal.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(base: Duration, multiplier: u32, max_attempts: u32) -> Self {
        Self {
            base,
            multiplier,
            max_attempts,
        }
    }

    /// Timeout for the given zero-based attempt.
    pub fn timeout(&self, attempt: u32) -> Duration {
        self.base * self.multiplier.saturating_pow(attempt)
    }

    /// The full escalation schedule, one timeout per attempt.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|attempt| self.timeout(attempt))
    }
}

impl Default for RetryPolicy {
    /// 300 ms base, doubled per attempt, three attempts.
    fn default() -> Self {
        Self {
            base: Duration::from_millis(300),
            multiplier: 2,
            max_attempts: 3,
        }
    }
}
