use std::time::Duration;

use crate::config::SchedulerConfig;

/// Exponential backoff between resumptions of a task after a provider failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Backoff {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.provider_retry_attempts,
            base_delay_ms: config.backoff_base_ms,
            max_delay_ms: config.backoff_max_ms,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
