use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a model backend failed at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFailureKind {
    Timeout,
    Auth,
    RateLimited,
    Server,
    Transport,
    /// Request refused for a reason retrying will not fix (4xx other than auth / rate limit).
    Rejected,
}

impl ProviderFailureKind {
    /// Auth and Rejected failures need operator action; the others clear up on their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth | Self::Rejected)
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            408 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::Server,
            _ => Self::Rejected,
        }
    }
}

impl std::fmt::Display for ProviderFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Transport => "transport",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The OS refused or failed the injected event.
    Device,
    /// The sequence did not finish inside the execution phase timeout.
    Timeout,
}

/// Device-level failure reported by an action executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {detail}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub detail: String,
}

impl ExecutionError {
    pub fn device(detail: impl Into<String>) -> Self {
        Self { kind: ExecutionErrorKind::Device, detail: detail.into() }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self { kind: ExecutionErrorKind::Timeout, detail: detail.into() }
    }
}

#[derive(Debug, Error)]
pub enum DeskPilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Perception error: {0}")]
    Perception(String),

    #[error("Screen capture exceeded {ms}ms")]
    CaptureTimeout { ms: u64 },

    #[error("Model output unusable after {attempts} attempts: {detail}")]
    DecisionFailure { attempts: u32, detail: String },

    #[error("Provider failure ({kind}): {detail}")]
    ProviderFailure { kind: ProviderFailureKind, detail: String },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl DeskPilotError {
    pub fn provider(kind: ProviderFailureKind, detail: impl Into<String>) -> Self {
        Self::ProviderFailure { kind, detail: detail.into() }
    }

    /// Provider failures that the scheduler may retry with backoff.
    pub fn is_retryable_provider_failure(&self) -> bool {
        match self {
            Self::ProviderFailure { kind, .. } => kind.is_retryable(),
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl serde::Serialize for DeskPilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type DeskResult<T> = Result<T, DeskPilotError>;
