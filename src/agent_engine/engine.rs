use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::GrayImage;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::event_bus::{EventBus, TaskEvent};
use crate::agent_engine::history::TaskJournal;
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::state::{
    Action, DecisionRecord, Expectation, Step, StepOutcome, Task, TaskStatus, TerminalReason,
    VerificationResult,
};
use crate::config::{AgentConfig, Escalation};
use crate::errors::{DeskPilotError, DeskResult};
use crate::executor::input::InputOp;
use crate::executor::translator;
use crate::llm::gateway::ModelGateway;
use crate::llm::registry::ProviderProfile;
use crate::perception::library::TemplateLibrary;
use crate::perception::pipeline::ScreenPerception;
use crate::perception::template::MatchCandidate;
use crate::perception::types::{FrameRef, ScreenState};
use crate::scheduler::device_gate::DeviceGate;

/// Collaborators shared by every agent the scheduler runs.
pub struct AgentContext {
    pub perception: Arc<ScreenPerception>,
    pub gateway: Arc<ModelGateway>,
    pub templates: Arc<TemplateLibrary>,
    pub gate: Arc<DeviceGate>,
    pub config: AgentConfig,
    pub events: EventBus,
}

/// How a call to [`TaskAgent::run`] ended.
#[derive(Debug)]
pub enum RunExit {
    /// The task reached a terminal status.
    Finished,
    /// A retryable provider failure stopped the loop; the task is still `Running`
    /// and `run` may be called again to resume with its history intact.
    Interrupted(DeskPilotError),
}

enum Flow {
    Continue,
    Stop,
}

/// Drives one task through capture → decide → translate → execute → verify.
pub struct TaskAgent {
    ctx: Arc<AgentContext>,
    profile: Arc<ProviderProfile>,
    task: Task,
    control: LoopController,
    cancel: CancellationToken,
    snapshot: Arc<watch::Sender<Task>>,
    journal: Option<TaskJournal>,
}

impl TaskAgent {
    pub fn new(
        ctx: Arc<AgentContext>,
        profile: Arc<ProviderProfile>,
        task: Task,
        cancel: CancellationToken,
        snapshot: Arc<watch::Sender<Task>>,
    ) -> Self {
        let journal = ctx.config.journal_dir.as_ref().and_then(|dir| {
            TaskJournal::create(dir, task.id)
                .map_err(|e| tracing::warn!(error = %e, "task journal disabled"))
                .ok()
        });
        let control = LoopController::new(&ctx.config);
        Self { ctx, profile, task, control, cancel, snapshot, journal }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Run until the task is terminal or a retryable provider failure interrupts it.
    pub async fn run(&mut self) -> RunExit {
        if self.task.is_terminal() {
            return RunExit::Finished;
        }
        if self.task.start() {
            self.control = LoopController::new(&self.ctx.config);
            tracing::info!(
                task_id = %self.task.id,
                goal = %self.task.goal,
                provider = %self.profile.name,
                "task started"
            );
            if let Some(journal) = &self.journal {
                if let Err(e) = journal.started(&self.task) {
                    tracing::warn!(error = %e, "journal write failed");
                }
            }
            self.ctx.events.publish(TaskEvent::StatusChanged {
                task_id: self.task.id,
                status: TaskStatus::Running,
                reason: None,
            });
            self.publish_snapshot();
        }

        loop {
            match self.iterate().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return RunExit::Finished,
                Err(e) if e.is_retryable_provider_failure() => {
                    tracing::warn!(task_id = %self.task.id, error = %e, "provider failure, handing back to scheduler");
                    return RunExit::Interrupted(e);
                }
                Err(e) => {
                    self.fail(TerminalReason::from_error(&e));
                    return RunExit::Finished;
                }
            }
        }
    }

    /// Terminate as `Failed`; no-op when already terminal.
    pub fn fail(&mut self, reason: TerminalReason) {
        self.finish(TaskStatus::Failed, reason);
    }

    /// Terminate as `Cancelled`; used when the task is cancelled between runs.
    pub fn cancel_now(&mut self) {
        self.finish(TaskStatus::Cancelled, TerminalReason::Cancelled);
    }

    async fn iterate(&mut self) -> DeskResult<Flow> {
        if self.cancel.is_cancelled() {
            self.cancel_now();
            return Ok(Flow::Stop);
        }
        if let Some(detail) = self.control.budget_exhausted(self.task.steps.len()) {
            self.fail(TerminalReason::BudgetExceeded { detail });
            return Ok(Flow::Stop);
        }

        // Observe
        let state = match self.ctx.perception.capture().await {
            Ok(state) => state,
            Err(DeskPilotError::CaptureTimeout { ms }) => {
                self.control.record_failure();
                if self.control.failures_exhausted() {
                    self.fail(TerminalReason::CaptureTimeout {
                        detail: format!(
                            "capture exceeded {ms}ms {} times in a row",
                            self.control.consecutive_failures()
                        ),
                    });
                    return Ok(Flow::Stop);
                }
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e),
        };
        let frame = state.frame_ref();

        // Decide
        let gateway = self.ctx.gateway.clone();
        let cancel = self.cancel.clone();
        let decided = tokio::select! {
            res = gateway.decide(&self.task.goal, &self.task.steps, &state, &self.profile) => Some(res),
            _ = cancel.cancelled() => None,
        };
        let Some(decision) = decided else {
            self.cancel_now();
            return Ok(Flow::Stop);
        };
        let decision = decision?;
        let record = decision.record();
        let frame = self.save_frame(&state, frame).await;

        // Act
        let outcome = match &decision.action {
            Action::Done { summary } => {
                self.append_step(frame, record, StepOutcome::Completed { summary: summary.clone() });
                self.finish(TaskStatus::Succeeded, TerminalReason::Completed { summary: summary.clone() });
                return Ok(Flow::Stop);
            }
            Action::Fail { reason } => {
                self.append_step(frame, record, StepOutcome::Abandoned { reason: reason.clone() });
                self.fail(TerminalReason::ModelGaveUp { reason: reason.clone() });
                return Ok(Flow::Stop);
            }
            Action::Wait { ms } => {
                let ms = (*ms).min(self.ctx.config.max_wait_for_ms);
                if !self.pause(Duration::from_millis(ms)).await {
                    self.cancel_now();
                    return Ok(Flow::Stop);
                }
                StepOutcome::Executed { ops: 0, verification: None }
            }
            Action::WaitFor { template, timeout_ms } => {
                let image = self.ctx.templates.require(template)?;
                match self.wait_for(image, *timeout_ms).await {
                    Some(found) => StepOutcome::Waited { found: found?.map(|m| m.region) },
                    None => {
                        self.cancel_now();
                        return Ok(Flow::Stop);
                    }
                }
            }
            action => {
                let ops = translator::translate(action, &state.bounds())?;
                if self.cancel.is_cancelled() {
                    self.cancel_now();
                    return Ok(Flow::Stop);
                }
                self.act(ops, decision.expect.as_ref()).await?
            }
        };

        let failure = self.failure_reason(&outcome);
        match &failure {
            Some(_) => self.control.record_failure(),
            None => self.control.record_success(),
        }
        self.append_step(frame, record, outcome);

        if let Some(reason) = failure {
            if self.control.failures_exhausted() {
                tracing::warn!(
                    task_id = %self.task.id,
                    failures = self.control.consecutive_failures(),
                    "consecutive failure ceiling reached"
                );
                self.fail(reason);
                return Ok(Flow::Stop);
            }
        }
        if let Some(detail) = self.control.budget_exhausted(self.task.steps.len()) {
            self.fail(TerminalReason::BudgetExceeded { detail });
            return Ok(Flow::Stop);
        }

        if self.ctx.config.step_delay_ms > 0
            && !self.pause(Duration::from_millis(self.ctx.config.step_delay_ms)).await
        {
            self.cancel_now();
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Write the frame under `screenshot_dir` and record where it went.
    async fn save_frame(&self, state: &ScreenState, mut frame: FrameRef) -> FrameRef {
        let Some(dir) = &self.ctx.config.screenshot_dir else {
            return frame;
        };
        let path: PathBuf = dir
            .join(self.task.id.to_string())
            .join(format!("step_{:03}.png", self.task.steps.len()));
        let image = state.frame.clone();
        let target = path.clone();
        let saved = tokio::task::spawn_blocking(move || -> DeskResult<()> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            image.save(&target)?;
            Ok(())
        })
        .await;
        match saved {
            Ok(Ok(())) => frame.path = Some(path),
            Ok(Err(e)) => tracing::warn!(path = %path.display(), error = %e, "step screenshot not saved"),
            Err(e) => tracing::warn!(error = %e, "step screenshot task failed"),
        }
        frame
    }

    /// `None` when cancelled while waiting.
    async fn wait_for(&self, template: Arc<GrayImage>, timeout_ms: u64) -> Option<DeskResult<Option<MatchCandidate>>> {
        let timeout = Duration::from_millis(timeout_ms.min(self.ctx.config.max_wait_for_ms));
        let poll = Duration::from_millis(self.ctx.config.wait_for_poll_ms.max(1));
        tokio::select! {
            res = self.ctx.perception.wait_for_template(template, timeout, poll) => Some(res),
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Execute through the device gate, then verify the expected change if one was given.
    async fn act(&self, ops: Vec<InputOp>, expect: Option<&Expectation>) -> DeskResult<StepOutcome> {
        let count = ops.len();
        let timeout = self.ctx.config.execution_timeout();
        if let Err(error) = self.ctx.gate.run(self.task.id, ops.clone(), timeout).await {
            return Ok(StepOutcome::ExecutionFailed { error });
        }
        self.settle().await;

        let Some(expect) = expect else {
            return Ok(StepOutcome::Executed { ops: count, verification: None });
        };
        let Some(template) = self.ctx.templates.get(&expect.template) else {
            tracing::warn!(template = %expect.template, "unknown template in expectation, skipping verification");
            return Ok(StepOutcome::Executed { ops: count, verification: None });
        };

        let checks = self.ctx.config.verification_attempts.max(1);
        let interval = expect
            .timeout_ms
            .map(|ms| Duration::from_millis(ms / checks as u64))
            .unwrap_or(Duration::from_millis(self.ctx.config.verification_interval_ms));

        let (mut confirmed, mut attempts) = self.verify(template.clone(), checks, interval).await?;
        let mut retried_action = false;
        if !confirmed && self.ctx.config.escalation == Escalation::RetryAction {
            tracing::info!(task_id = %self.task.id, template = %expect.template, "verification failed, retrying action once");
            retried_action = true;
            if let Err(error) = self.ctx.gate.run(self.task.id, ops, timeout).await {
                return Ok(StepOutcome::ExecutionFailed { error });
            }
            self.settle().await;
            let (again, more) = self.verify(template.clone(), checks, interval).await?;
            confirmed = again;
            attempts += more;
        }

        Ok(StepOutcome::Executed {
            ops: count,
            verification: Some(VerificationResult {
                template: expect.template.clone(),
                confirmed,
                attempts,
                retried_action,
            }),
        })
    }

    /// Up to `checks` captures looking for `template`. Returns (confirmed, checks used).
    async fn verify(&self, template: Arc<GrayImage>, checks: u32, interval: Duration) -> DeskResult<(bool, u32)> {
        for attempt in 1..=checks {
            match self.ctx.perception.capture().await {
                Ok(state) => {
                    if !self.ctx.perception.find(&state, template.clone()).await?.is_empty() {
                        return Ok((true, attempt));
                    }
                }
                Err(DeskPilotError::CaptureTimeout { .. }) => {}
                Err(e) => return Err(e),
            }
            if attempt < checks {
                tokio::time::sleep(interval).await;
            }
        }
        Ok((false, checks))
    }

    async fn settle(&self) {
        if let Err(e) = self.ctx.perception.settle().await {
            tracing::warn!(error = %e, "settle check failed");
        }
    }

    fn failure_reason(&self, outcome: &StepOutcome) -> Option<TerminalReason> {
        match outcome {
            StepOutcome::ExecutionFailed { error } => Some(TerminalReason::ExecutionError {
                detail: format!("{} consecutive failures, last: {error}", self.control.consecutive_failures() + 1),
            }),
            StepOutcome::Executed { verification: Some(v), .. } if !v.confirmed => {
                Some(TerminalReason::VerificationFailure {
                    detail: format!(
                        "'{}' not confirmed; {} consecutive failures",
                        v.template,
                        self.control.consecutive_failures() + 1
                    ),
                })
            }
            _ => None,
        }
    }

    fn append_step(&mut self, frame: FrameRef, decision: DecisionRecord, outcome: StepOutcome) {
        let step = Step {
            index: self.task.steps.len(),
            frame,
            decision,
            outcome,
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.task.push_step(step.clone()) {
            tracing::error!(task_id = %self.task.id, error = %e, "step rejected");
            return;
        }
        tracing::info!(
            task_id = %self.task.id,
            step = step.index,
            action = %step.decision.action.describe(),
            outcome = %step.outcome.describe(),
            "step recorded"
        );
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.step(&step) {
                tracing::warn!(error = %e, "journal write failed");
            }
        }
        self.ctx.events.publish(TaskEvent::StepAppended { task_id: self.task.id, step });
        self.publish_snapshot();
    }

    fn finish(&mut self, status: TaskStatus, reason: TerminalReason) {
        if !self.task.finish(status, reason.clone()) {
            return;
        }
        tracing::info!(
            task_id = %self.task.id,
            status = ?status,
            steps = self.task.steps.len(),
            reason = %reason,
            "task finished"
        );
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.finished(&self.task) {
                tracing::warn!(error = %e, "journal write failed");
            }
        }
        self.ctx.events.publish(TaskEvent::StatusChanged {
            task_id: self.task.id,
            status,
            reason: Some(reason),
        });
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.task.clone());
    }
}
