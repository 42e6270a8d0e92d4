use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent_engine::state::{Step, TaskId, TaskStatus, TerminalReason};

/// Progress notifications for presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted {
        task_id: TaskId,
        goal: String,
        provider: String,
    },
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<TerminalReason>,
    },
    StepAppended {
        task_id: TaskId,
        step: Step,
    },
    /// The task hit a retryable provider failure and resumes after `delay_ms`.
    Retrying {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Submitted { task_id, .. }
            | Self::StatusChanged { task_id, .. }
            | Self::StepAppended { task_id, .. }
            | Self::Retrying { task_id, .. } => *task_id,
        }
    }
}

/// Fan-out of task events. Slow subscribers lag and lose old events; they can
/// always resynchronize from the scheduler's snapshots.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_task(&self, task_id: TaskId) -> TaskSubscription {
        TaskSubscription { task_id, rx: self.tx.subscribe() }
    }

    /// Publishing with nobody listening is not an error.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }
}

/// The bus narrowed to a single task's events.
pub struct TaskSubscription {
    task_id: TaskId,
    rx: broadcast::Receiver<TaskEvent>,
}

impl TaskSubscription {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Next event of this task. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.task_id() == self.task_id => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(task_id = %self.task_id, skipped, "task subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
