use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskResult, ExecutionError, ProviderFailureKind};
use crate::perception::types::{FrameRef, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

fn default_clicks() -> u32 {
    1
}

fn default_scroll_clicks() -> u32 {
    3
}

/// Provider-independent "what to do next".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i32,
        y: i32,
        #[serde(default)]
        button: MouseButton,
        /// 2 for a double click.
        #[serde(default = "default_clicks")]
        clicks: u32,
    },
    Drag {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
    },
    #[serde(alias = "type", alias = "type_text")]
    TypeText { text: String },
    #[serde(rename = "hotkey", alias = "hot_key")]
    HotKey { keys: Vec<String> },
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_clicks")]
        clicks: u32,
    },
    Wait { ms: u64 },
    WaitFor { template: String, timeout_ms: u64 },
    #[serde(alias = "finish")]
    Done { summary: String },
    Fail { reason: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Drag { .. } => "drag",
            Self::TypeText { .. } => "type_text",
            Self::HotKey { .. } => "hotkey",
            Self::Scroll { .. } => "scroll",
            Self::Wait { .. } => "wait",
            Self::WaitFor { .. } => "wait_for",
            Self::Done { .. } => "done",
            Self::Fail { .. } => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Fail { .. })
    }

    /// One-line rendering used in prompts and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Click { x, y, button, clicks } => {
                if *clicks > 1 {
                    format!("click({x},{y},{button:?} x{clicks})")
                } else {
                    format!("click({x},{y},{button:?})")
                }
            }
            Self::Drag { x1, y1, x2, y2 } => format!("drag({x1},{y1} -> {x2},{y2})"),
            Self::TypeText { text } => format!("type_text({text:?})"),
            Self::HotKey { keys } => format!("hotkey({})", keys.join("+")),
            Self::Scroll { direction, clicks } => format!("scroll({direction:?} x{clicks})"),
            Self::Wait { ms } => format!("wait({ms}ms)"),
            Self::WaitFor { template, timeout_ms } => format!("wait_for({template}, {timeout_ms}ms)"),
            Self::Done { summary } => format!("done({summary:?})"),
            Self::Fail { reason } => format!("fail({reason:?})"),
        }
    }
}

/// Visual change the model expects after an action; drives verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub template: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub action: Action,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Expectation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub template: String,
    pub confirmed: bool,
    pub attempts: u32,
    /// The action was executed a second time before the final check.
    pub retried_action: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Executed {
        ops: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verification: Option<VerificationResult>,
    },
    /// `None` means the template never appeared (a normal outcome).
    Waited { found: Option<Rect> },
    ExecutionFailed { error: ExecutionError },
    Completed { summary: String },
    Abandoned { reason: String },
}

impl StepOutcome {
    /// Whether this outcome counts against the consecutive-failure ceiling.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::ExecutionFailed { .. } => true,
            Self::Executed { verification: Some(v), .. } => !v.confirmed,
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Executed { ops, verification: None } => format!("executed ({ops} input ops)"),
            Self::Executed { ops, verification: Some(v) } => {
                let verdict = if v.confirmed { "confirmed" } else { "NOT confirmed" };
                let retried = if v.retried_action { ", action retried" } else { "" };
                format!(
                    "executed ({ops} input ops); expected '{}' {verdict} after {} checks{retried}",
                    v.template, v.attempts
                )
            }
            Self::Waited { found: Some(r) } => format!("template appeared at ({},{}) {}x{}", r.x, r.y, r.width, r.height),
            Self::Waited { found: None } => "template did not appear before timeout".to_string(),
            Self::ExecutionFailed { error } => format!("execution failed: {error}"),
            Self::Completed { summary } => format!("completed: {summary}"),
            Self::Abandoned { reason } => format!("gave up: {reason}"),
        }
    }
}

/// One loop iteration. Immutable once appended to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub frame: FrameRef,
    pub decision: DecisionRecord,
    pub outcome: StepOutcome,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Why a task stopped; its `Display` is the user-facing explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    Completed { summary: String },
    ModelGaveUp { reason: String },
    DecisionFailure { detail: String },
    ProviderFailure { provider_kind: ProviderFailureKind, detail: String },
    InvalidAction { detail: String },
    ExecutionError { detail: String },
    VerificationFailure { detail: String },
    CaptureTimeout { detail: String },
    BudgetExceeded { detail: String },
    Internal { detail: String },
    Cancelled,
}

impl TerminalReason {
    pub fn from_error(err: &DeskPilotError) -> Self {
        let detail = err.to_string();
        match err {
            DeskPilotError::DecisionFailure { .. } => Self::DecisionFailure { detail },
            DeskPilotError::ProviderFailure { kind, .. } => Self::ProviderFailure { provider_kind: *kind, detail },
            DeskPilotError::Http(e) => {
                let provider_kind = if e.is_timeout() {
                    ProviderFailureKind::Timeout
                } else {
                    ProviderFailureKind::Transport
                };
                Self::ProviderFailure { provider_kind, detail }
            }
            DeskPilotError::InvalidAction(_) => Self::InvalidAction { detail },
            DeskPilotError::CaptureTimeout { .. } => Self::CaptureTimeout { detail },
            _ => Self::Internal { detail },
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed { summary } => write!(f, "Completed: {summary}"),
            Self::ModelGaveUp { reason } => write!(f, "Model reported failure: {reason}"),
            Self::DecisionFailure { detail } => write!(f, "DecisionFailure: {detail}"),
            Self::ProviderFailure { provider_kind, detail } => {
                write!(f, "ProviderFailure ({provider_kind}): {detail}")
            }
            Self::InvalidAction { detail } => write!(f, "InvalidAction: {detail}"),
            Self::ExecutionError { detail } => write!(f, "ExecutionError: {detail}"),
            Self::VerificationFailure { detail } => write!(f, "VerificationFailure: {detail}"),
            Self::CaptureTimeout { detail } => write!(f, "CaptureTimeout: {detail}"),
            Self::BudgetExceeded { detail } => write!(f, "BudgetExceeded: {detail}"),
            Self::Internal { detail } => write!(f, "Internal error: {detail}"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// One goal and its execution record. Mutated only by the agent that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub goal: String,
    /// Provider profile the task runs against; fixed for the task's lifetime.
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub steps: Vec<Step>,
    pub terminal_reason: Option<TerminalReason>,
}

impl Task {
    pub fn new(id: TaskId, goal: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id,
            goal: goal.into(),
            provider: provider.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: TaskStatus::Pending,
            steps: Vec::new(),
            terminal_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending → Running. Re-entering Running (after a provider backoff) is a no-op.
    pub fn start(&mut self) -> bool {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Running;
                self.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Append the next step. Rejected once the task is terminal or if the index is out of order.
    pub fn push_step(&mut self, step: Step) -> DeskResult<()> {
        if self.is_terminal() {
            return Err(DeskPilotError::Scheduler(format!("task {} is already terminal", self.id)));
        }
        if step.index != self.steps.len() {
            return Err(DeskPilotError::Scheduler(format!(
                "step index {} out of order (expected {})",
                step.index,
                self.steps.len()
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Move into a terminal status. Returns false, changing nothing, if already terminal.
    pub fn finish(&mut self, status: TaskStatus, reason: TerminalReason) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.terminal_reason = Some(reason);
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, reason: TerminalReason) -> bool {
        self.finish(TaskStatus::Failed, reason)
    }
}
