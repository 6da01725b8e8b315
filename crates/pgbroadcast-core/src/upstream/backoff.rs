//! Bounded exponential backoff for upstream reconnects.

use std::time::Duration;

/// Default delay before the first reconnect attempt.
pub const DEFAULT_MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Default upper bound on the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// Reconnect delay state machine.
///
/// Starts at `min`, doubles after every failed attempt and never exceeds
/// `max`. A successful attempt resets it to `min`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff between `min` and `max`.
    ///
    /// If `max` is below `min` it is raised to `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt, advancing the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Lower bound.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RECONNECT_INTERVAL, DEFAULT_MAX_RECONNECT_INTERVAL)
    }
}
