use std::time::Duration;

use tokio::time::Instant;

use crate::config::AgentConfig;

/// Step/time budget and the consecutive-failure ceiling of one task.
pub struct LoopController {
    max_steps: usize,
    max_duration: Duration,
    max_consecutive_failures: u32,
    start_time: Instant,
    failure_count: u32,
}

impl LoopController {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_duration: config.max_duration(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            start_time: Instant::now(),
            failure_count: 0,
        }
    }

    /// Why the budget is spent, if it is.
    pub fn budget_exhausted(&self, steps: usize) -> Option<String> {
        if steps >= self.max_steps {
            return Some(format!("step ceiling of {} reached", self.max_steps));
        }
        if self.start_time.elapsed() >= self.max_duration {
            return Some(format!("deadline of {}s reached", self.max_duration.as_secs()));
        }
        None
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failure_count
    }

    pub fn failures_exhausted(&self) -> bool {
        self.failure_count >= self.max_consecutive_failures
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
