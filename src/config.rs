use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub perception: PerceptionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub display_name: String,
    /// Falls back to the adapter's well-known endpoint when absent.
    pub api_base: Option<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// "openai" (default), "anthropic", "ollama" or any alias such as "qwen" / "kimi".
    pub adapter: Option<String>,
    /// Inline key. Prefer `api_key_env`; the env var `DESKPILOT_<ID>_API_KEY` wins over both.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Whether the model accepts image input.
    #[serde(default = "default_true")]
    pub vision: bool,
    #[serde(default = "default_max_context")]
    pub max_context_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Sliding one-minute window; `None` means unlimited.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    /// Minimum spacing between two requests to the same provider.
    #[serde(default)]
    pub min_interval_ms: u64,
}

fn default_temperature() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_max_context() -> u32 {
    32_000
}

fn default_request_timeout() -> u64 {
    60
}

/// What the perception layer captures. Chosen by configuration, never by the loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureTarget {
    #[default]
    PrimaryMonitor,
    Monitor { index: usize },
    FocusedWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    pub target: CaptureTarget,
    pub capture_timeout_ms: u64,
    /// Directory of `<name>.png` reference images usable by `wait_for` and `expect`.
    pub template_dir: Option<PathBuf>,
    pub match_threshold: f32,
    /// Template sizes tried by every lookup, relative to the stored image.
    /// `[1.0]` searches at the stored size only.
    pub match_scales: Vec<f32>,
    pub settle: SettleConfig,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            target: CaptureTarget::PrimaryMonitor,
            capture_timeout_ms: 500,
            template_dir: None,
            match_threshold: 0.8,
            match_scales: vec![1.0],
            settle: SettleConfig::default(),
        }
    }
}

impl PerceptionConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    pub enabled: bool,
    pub max_wait_ms: u64,
    pub check_interval_ms: u64,
    /// Fraction of sampled pixels allowed to differ between two frames.
    pub stability_threshold: f64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_wait_ms: 3000,
            check_interval_ms: 200,
            stability_threshold: 0.02,
        }
    }
}

/// What the loop does once post-action verification has failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// Execute the same action once more, then verify again.
    RetryAction,
    /// Record the failure and let the model plan around it.
    #[default]
    Replan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub max_duration_secs: u64,
    /// Model calls per decision, including the first one. Corrective re-prompts = this - 1.
    pub max_decision_attempts: u32,
    /// Most recent steps quoted verbatim in the prompt; older ones are summarized.
    pub history_window: usize,
    pub summary_max_chars: usize,
    pub verification_attempts: u32,
    pub verification_interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub escalation: Escalation,
    pub decision_timeout_ms: u64,
    pub execution_timeout_ms: u64,
    pub step_delay_ms: u64,
    pub wait_for_poll_ms: u64,
    pub max_wait_for_ms: u64,
    /// JSONL step journal per task; disabled when unset.
    pub journal_dir: Option<PathBuf>,
    /// Each step's frame is saved as `<dir>/<task id>/step_NNN.png`; disabled when unset.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_duration_secs: 600,
            max_decision_attempts: 3,
            history_window: 6,
            summary_max_chars: 600,
            verification_attempts: 3,
            verification_interval_ms: 300,
            max_consecutive_failures: 5,
            escalation: Escalation::Replan,
            decision_timeout_ms: 60_000,
            execution_timeout_ms: 10_000,
            step_delay_ms: 0,
            wait_for_poll_ms: 250,
            max_wait_for_ms: 30_000,
            journal_dir: None,
            screenshot_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub max_concurrent_tasks: usize,
    /// Resumptions of a task after a retryable provider failure.
    pub provider_retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub retention_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            max_concurrent_tasks: 4,
            provider_retry_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            retention_secs: 3_600,
        }
    }
}

fn resolve_config_path() -> DeskResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("deskpilot").join("config.toml");
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in user config dir");
            return Ok(candidate);
        }
    }

    Err(DeskPilotError::Config(
        "config.toml not found next to executable, in working directory or user config dir".into(),
    ))
}

pub fn parse_config(content: &str) -> DeskResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    if config.agent.max_decision_attempts == 0 {
        return Err(DeskPilotError::Config("agent.max_decision_attempts must be at least 1".into()));
    }
    if config.agent.max_steps == 0 {
        return Err(DeskPilotError::Config("agent.max_steps must be at least 1".into()));
    }
    if config.perception.match_scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(DeskPilotError::Config("perception.match_scales must be positive".into()));
    }
    if config.scheduler.queue_capacity == 0 || config.scheduler.max_concurrent_tasks == 0 {
        return Err(DeskPilotError::Config(
            "scheduler.queue_capacity and scheduler.max_concurrent_tasks must be positive".into(),
        ));
    }
    Ok(config)
}

pub fn load_config_from(path: &Path) -> DeskResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

pub fn load_config() -> DeskResult<AppConfig> {
    let path = resolve_config_path()?;
    load_config_from(&path)
}
