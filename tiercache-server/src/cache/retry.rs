//! Exponential backoff for L2 recovery probes

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule between reconnect attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Delay before attempt number `attempt` (0-based), capped at `max_ms`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let delay = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_multiplier_below_one_is_flat() {
        let backoff = Backoff {
            initial_ms: 50,
            max_ms: 1000,
            multiplier: 0.5,
        };
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(50));
    }
}
