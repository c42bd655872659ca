//! Reconnect backoff
//!
//! delay = initial * multiplier^attempt, capped at `max`.

use std::time::Duration;

use crate::config::WatcherConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&WatcherConfig::default())
    }
}

impl From<&WatcherConfig> for Backoff {
    fn from(config: &WatcherConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial.min(self.max);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(delay_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(30));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_initial_above_max_is_capped() {
        let backoff = Backoff {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
    }
}
