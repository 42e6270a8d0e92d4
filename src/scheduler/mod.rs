//! Task admission and supervision.
//!
//! Tasks enter a bounded queue and run on their own tokio tasks, up to
//! `max_concurrent_tasks` at once. Perception and decision phases of different
//! tasks overlap freely; input execution goes through the shared [`DeviceGate`].
//! Retryable provider failures suspend a task, which resumes with exponential
//! backoff until the retry budget is spent.

pub mod backoff;
pub mod device_gate;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::agent_engine::engine::{AgentContext, RunExit, TaskAgent};
use crate::agent_engine::event_bus::{TaskEvent, TaskSubscription};
use crate::agent_engine::state::{Step, Task, TaskId, TaskStatus, TerminalReason};
use crate::config::SchedulerConfig;
use crate::errors::{DeskPilotError, DeskResult};
use crate::llm::registry::{ProviderProfile, ProviderRegistry};

pub use backoff::Backoff;
pub use device_gate::DeviceGate;

struct TaskEntry {
    snapshot: Arc<watch::Sender<Task>>,
    cancel: CancellationToken,
    /// Raised by whichever of the dispatcher or [`Scheduler::cancel`] first moves
    /// the task out of `Pending`.
    claimed: Arc<AtomicBool>,
}

impl TaskEntry {
    fn current(&self) -> Task {
        self.snapshot.borrow().clone()
    }
}

type TaskTable = Arc<Mutex<HashMap<TaskId, TaskEntry>>>;

struct Job {
    agent: TaskAgent,
    cancel: CancellationToken,
    claimed: Arc<AtomicBool>,
}

/// Row of [`Scheduler::list`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub goal: String,
    pub provider: String,
    pub status: TaskStatus,
    pub steps: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            goal: task.goal.clone(),
            provider: task.provider.clone(),
            status: task.status,
            steps: task.steps.len(),
            created_at: task.created_at,
            finished_at: task.finished_at,
            reason: task.terminal_reason.as_ref().map(ToString::to_string),
        }
    }
}

/// Task counts per status, as reported by [`Scheduler::summary`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl SchedulerSummary {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }
}

pub struct Scheduler {
    ctx: Arc<AgentContext>,
    registry: ProviderRegistry,
    config: SchedulerConfig,
    tasks: TaskTable,
    queue: mpsc::Sender<Job>,
}

impl Scheduler {
    /// Must be called inside a tokio runtime: the dispatcher is spawned here and
    /// stops once the scheduler is dropped and the queue drains.
    pub fn new(ctx: Arc<AgentContext>, registry: ProviderRegistry, config: SchedulerConfig) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let tasks: TaskTable = Arc::default();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        tokio::spawn(dispatch(rx, semaphore, tasks.clone(), Backoff::from_config(&config), ctx.clone()));
        tracing::info!(
            queue_capacity = config.queue_capacity,
            max_concurrent = config.max_concurrent_tasks,
            "scheduler started"
        );
        Self { ctx, registry, config, tasks, queue }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Queue a goal against a named provider profile (the active one when `None`).
    pub fn submit(&self, goal: &str, provider: Option<&str>) -> DeskResult<TaskId> {
        let profile = self.registry.resolve(provider)?;
        self.submit_with_profile(goal, profile)
    }

    /// Queue a goal against an explicit profile. Fails when the queue is full.
    pub fn submit_with_profile(&self, goal: &str, profile: Arc<ProviderProfile>) -> DeskResult<TaskId> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(DeskPilotError::Scheduler("goal must not be empty".into()));
        }
        self.prune_expired();

        let task = Task::new(TaskId::new(), goal, profile.name.clone());
        let id = task.id;
        let (snapshot, _) = watch::channel(task.clone());
        let snapshot = Arc::new(snapshot);
        let cancel = CancellationToken::new();
        let claimed = Arc::new(AtomicBool::new(false));
        let agent = TaskAgent::new(self.ctx.clone(), profile.clone(), task, cancel.clone(), snapshot.clone());

        self.lock_tasks().insert(
            id,
            TaskEntry { snapshot, cancel: cancel.clone(), claimed: claimed.clone() },
        );
        if let Err(e) = self.queue.try_send(Job { agent, cancel, claimed }) {
            self.lock_tasks().remove(&id);
            let detail = match e {
                mpsc::error::TrySendError::Full(_) => {
                    format!("task queue is full ({} waiting)", self.config.queue_capacity)
                }
                mpsc::error::TrySendError::Closed(_) => "scheduler is shut down".to_string(),
            };
            tracing::warn!(goal, %detail, "task rejected");
            return Err(DeskPilotError::Scheduler(detail));
        }

        tracing::info!(task_id = %id, goal, provider = %profile.name, "task submitted");
        self.ctx.events.publish(TaskEvent::Submitted {
            task_id: id,
            goal: goal.to_string(),
            provider: profile.name.clone(),
        });
        Ok(id)
    }

    /// Latest snapshot of a task.
    pub fn status(&self, id: TaskId) -> DeskResult<Task> {
        self.lock_tasks()
            .get(&id)
            .map(TaskEntry::current)
            .ok_or_else(|| DeskPilotError::UnknownTask(id.to_string()))
    }

    /// Request cancellation. A task still waiting in the queue is cancelled on
    /// the spot; a running one stops at its next loop boundary.
    /// Returns `false` when the task had already finished.
    pub fn cancel(&self, id: TaskId) -> DeskResult<bool> {
        let tasks = self.lock_tasks();
        let entry = tasks.get(&id).ok_or_else(|| DeskPilotError::UnknownTask(id.to_string()))?;
        if entry.current().is_terminal() {
            return Ok(false);
        }
        entry.cancel.cancel();
        if entry.claimed.swap(true, Ordering::AcqRel) {
            tracing::info!(task_id = %id, "cancellation requested");
            return Ok(true);
        }

        let mut finished = false;
        entry.snapshot.send_modify(|task| {
            finished = task.finish(TaskStatus::Cancelled, TerminalReason::Cancelled);
        });
        if finished {
            tracing::info!(task_id = %id, "task cancelled before it started");
            self.ctx.events.publish(TaskEvent::StatusChanged {
                task_id: id,
                status: TaskStatus::Cancelled,
                reason: Some(TerminalReason::Cancelled),
            });
        }
        Ok(true)
    }

    /// Events of one task only.
    pub fn subscribe(&self, id: TaskId) -> DeskResult<TaskSubscription> {
        if !self.lock_tasks().contains_key(&id) {
            return Err(DeskPilotError::UnknownTask(id.to_string()));
        }
        Ok(self.ctx.events.subscribe_task(id))
    }

    /// Events of every task.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TaskEvent> {
        self.ctx.events.subscribe()
    }

    /// Watch one task's snapshots as they change.
    pub fn watch(&self, id: TaskId) -> DeskResult<watch::Receiver<Task>> {
        self.lock_tasks()
            .get(&id)
            .map(|e| e.snapshot.subscribe())
            .ok_or_else(|| DeskPilotError::UnknownTask(id.to_string()))
    }

    /// Steps recorded from index `from` on, for incremental progress polling.
    pub fn steps_since(&self, id: TaskId, from: usize) -> DeskResult<Vec<Step>> {
        let task = self.status(id)?;
        Ok(task.steps.into_iter().skip(from).collect())
    }

    /// Wait until the task is terminal and return its final snapshot.
    pub async fn wait(&self, id: TaskId) -> DeskResult<Task> {
        let mut rx = self.watch(id)?;
        let finished = rx.wait_for(|t| t.is_terminal()).await.map(|t| t.clone());
        match finished {
            Ok(task) => Ok(task),
            // Record pruned while waiting
            Err(_) => self.status(id),
        }
    }

    pub fn list(&self) -> Vec<TaskSummary> {
        self.prune_expired();
        let mut rows: Vec<TaskSummary> =
            self.lock_tasks().values().map(|e| TaskSummary::from(&e.current())).collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }

    pub fn summary(&self) -> SchedulerSummary {
        let mut summary = SchedulerSummary::default();
        for entry in self.lock_tasks().values() {
            match entry.current().status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// Drop finished tasks older than the retention window.
    pub fn prune_expired(&self) {
        let retention = chrono::Duration::seconds(self.config.retention_secs.min(u32::MAX as u64) as i64);
        let now = Utc::now();
        self.lock_tasks().retain(|id, entry| {
            let task = entry.current();
            let expired = task.is_terminal() && task.finished_at.is_some_and(|at| now - at > retention);
            if expired {
                tracing::debug!(task_id = %id, "task record expired");
            }
            !expired
        });
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Job>,
    semaphore: Arc<Semaphore>,
    tasks: TaskTable,
    backoff: Backoff,
    ctx: Arc<AgentContext>,
) {
    while let Some(job) = rx.recv().await {
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            _ = job.cancel.cancelled() => None,
        };
        // Already finished by `Scheduler::cancel`
        if job.claimed.swap(true, Ordering::AcqRel) {
            continue;
        }
        let Some(permit) = permit else {
            let mut agent = job.agent;
            agent.cancel_now();
            continue;
        };
        let tasks = tasks.clone();
        let backoff = backoff.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let task_id = job.agent.task().id;
            let handle = tokio::spawn(drive(job, backoff, ctx));
            if let Err(e) = handle.await {
                tracing::error!(task_id = %task_id, error = %e, "task agent crashed");
                if let Some(entry) = tasks.lock().unwrap_or_else(|e| e.into_inner()).get(&task_id) {
                    entry.snapshot.send_modify(|task| {
                        task.fail(TerminalReason::Internal { detail: format!("agent crashed: {e}") });
                    });
                }
            }
        });
    }
    tracing::debug!("scheduler dispatcher stopped");
}

/// Run one task to a terminal status, resuming after retryable provider failures.
async fn drive(job: Job, backoff: Backoff, ctx: Arc<AgentContext>) {
    let Job { mut agent, cancel, .. } = job;
    if cancel.is_cancelled() {
        agent.cancel_now();
        return;
    }

    let mut retries = 0u32;
    loop {
        match agent.run().await {
            RunExit::Finished => break,
            RunExit::Interrupted(err) => {
                retries += 1;
                if !backoff.allows(retries) {
                    tracing::warn!(
                        task_id = %agent.task().id,
                        retries = retries - 1,
                        error = %err,
                        "provider retries exhausted"
                    );
                    agent.fail(TerminalReason::from_error(&err));
                    break;
                }
                let delay = backoff.delay(retries);
                tracing::info!(
                    task_id = %agent.task().id,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after provider failure"
                );
                ctx.events.publish(TaskEvent::Retrying {
                    task_id: agent.task().id,
                    attempt: retries,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }
}
