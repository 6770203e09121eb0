//! Reconnect policy: backoff delays for a store connection that keeps failing.

use std::time::Duration;

/// Exponential backoff with an upper bound.
///
/// delay = base_delay * multiplier^(failures - 1), capped at `max_delay`.
///
/// Example with base_delay=1s, multiplier=2.0, max_delay=30s:
/// - failure 1: 1s
/// - failure 2: 2s
/// - failure 3: 4s
/// - failure 6 and later: 30s
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt, given the number of consecutive
    /// failures so far (1-indexed; 0 is treated as 1).
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}
