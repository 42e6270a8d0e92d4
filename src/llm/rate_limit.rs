use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitPolicy;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-provider request pacing shared by every task using the same gateway.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `policy` allows another request to `provider`, then claim the slot.
    pub async fn acquire(&self, provider: &str, policy: &RateLimitPolicy) {
        if policy.requests_per_minute.is_none() && policy.min_interval_ms == 0 {
            return;
        }
        loop {
            let wait = match self.try_claim(provider, policy) {
                None => return,
                Some(wait) => wait,
            };
            tracing::debug!(provider, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// `None` when the slot was claimed, otherwise how long to wait before trying again.
    fn try_claim(&self, provider: &str, policy: &RateLimitPolicy) -> Option<Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(provider.to_string()).or_default();
        while window.front().is_some_and(|t| now.duration_since(*t) >= WINDOW) {
            window.pop_front();
        }

        let mut wait = Duration::ZERO;
        if let Some(last) = window.back() {
            let spacing = Duration::from_millis(policy.min_interval_ms);
            wait = wait.max(spacing.saturating_sub(now.duration_since(*last)));
        }
        if let Some(rpm) = policy.requests_per_minute {
            if rpm > 0 && window.len() >= rpm as usize {
                if let Some(oldest) = window.front() {
                    wait = wait.max(WINDOW.saturating_sub(now.duration_since(*oldest)));
                }
            }
        }

        if wait.is_zero() {
            window.push_back(now);
            None
        } else {
            Some(wait)
        }
    }
}
