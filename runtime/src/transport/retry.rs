//! Reconnect backoff.

use std::time::Duration;

use crate::config::Config;

/// Exponential backoff schedule for broker reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before the supervisor waits for a login change instead.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Ceiling for the exponential delay
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retry forever using the delays from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_delay: config.retry_initial,
            max_delay: config.retry_max.max(config.retry_initial),
            ..Self::default()
        }
    }

    /// Short delays for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }
        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn allows(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}
