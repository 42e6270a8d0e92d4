mod common;

use std::time::{Duration, Instant};

use deskpilot_lib::agent_engine::event_bus::TaskEvent;
use deskpilot_lib::agent_engine::state::{TaskId, TaskStatus, TerminalReason};
use deskpilot_lib::errors::{DeskPilotError, ProviderFailureKind};
use deskpilot_lib::executor::input::InputOp;
use deskpilot_lib::perception::library::TemplateLibrary;

use common::*;

fn blank_scheduler(model: std::sync::Arc<ScriptedModel>) -> deskpilot_lib::scheduler::Scheduler {
    scheduler(
        config(),
        FakeScreen::new(noise_frame(WIDTH, HEIGHT, 21)),
        model,
        RecordingExecutor::new(),
        TemplateLibrary::new(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_never_interleave_input_sequences() {
    let left = "drag on the left";
    let right = "drag on the right";
    let model = ScriptedModel::new();
    model.script(left, vec![reply(&drag(10, 10, 20, 20)), reply(&drag(11, 11, 21, 21)), reply(&done("left"))]);
    model.script(right, vec![reply(&drag(100, 10, 110, 20)), reply(&drag(101, 11, 111, 21)), reply(&done("right"))]);
    let executor = RecordingExecutor::slow(Duration::from_millis(5));
    let scheduler = scheduler(
        config(),
        FakeScreen::new(noise_frame(WIDTH, HEIGHT, 22)),
        model,
        executor.clone(),
        TemplateLibrary::new(),
    );

    let a = scheduler.submit(left, None).unwrap();
    let b = scheduler.submit(right, None).unwrap();
    assert_eq!(finish(&scheduler, a).await.status, TaskStatus::Succeeded);
    assert_eq!(finish(&scheduler, b).await.status, TaskStatus::Succeeded);

    let ops = executor.ops();
    assert_eq!(ops.len(), 16);
    for chunk in ops.chunks(4) {
        let xs: Vec<i32> = chunk
            .iter()
            .filter_map(|op| match op {
                InputOp::MoveTo { x, .. } => Some(*x),
                _ => None,
            })
            .collect();
        assert_eq!(xs.len(), 2, "sequence split apart: {chunk:?}");
        assert_eq!(xs[0] < 50, xs[1] < 50, "sequences from two tasks interleaved: {chunk:?}");
        assert!(matches!(chunk[1], InputOp::ButtonDown { .. }));
        assert!(matches!(chunk[3], InputOp::ButtonUp { .. }));
    }
}

#[tokio::test]
async fn cancellation_stops_a_running_task() {
    let goal = "click for a while";
    let model = ScriptedModel::with_delay(Duration::from_millis(30));
    model.script(goal, (0..20).map(|i| reply(&click(5 + i, 5))).collect());
    let scheduler = blank_scheduler(model.clone());

    let id = scheduler.submit(goal, None).unwrap();
    let mut rx = scheduler.watch(id).unwrap();
    rx.wait_for(|t| !t.steps.is_empty()).await.unwrap();
    assert!(scheduler.cancel(id).unwrap());

    let task = finish(&scheduler, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.terminal_reason, Some(TerminalReason::Cancelled));
    assert!(task.steps.len() < 20);
    // already terminal
    assert!(!scheduler.cancel(id).unwrap());
}

#[tokio::test]
async fn task_cancelled_while_queued_never_runs() {
    let goal = "never starts";
    let model = ScriptedModel::new();
    let scheduler = blank_scheduler(model.clone());

    // current-thread runtime: the dispatcher cannot pick the job up before the cancel
    let id = scheduler.submit(goal, None).unwrap();
    assert!(scheduler.cancel(id).unwrap());

    let task = finish(&scheduler, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.steps.is_empty());
    assert_eq!(model.calls_for(goal), 0);
}

#[tokio::test]
async fn queued_tasks_cancel_at_once_while_the_only_slot_is_busy() {
    let busy = "keeps the only slot";
    let mut cfg = config();
    cfg.scheduler.max_concurrent_tasks = 1;
    let model = ScriptedModel::with_delay(Duration::from_millis(50));
    model.script(busy, (0..20).map(|i| reply(&click(5 + i, 5))).collect());
    let scheduler = scheduler(
        cfg,
        FakeScreen::new(noise_frame(WIDTH, HEIGHT, 24)),
        model.clone(),
        RecordingExecutor::new(),
        TemplateLibrary::new(),
    );

    let a = scheduler.submit(busy, None).unwrap();
    let mut rx = scheduler.watch(a).unwrap();
    rx.wait_for(|t| t.status == TaskStatus::Running).await.unwrap();
    let b = scheduler.submit("queued first", None).unwrap();
    let c = scheduler.submit("queued second", None).unwrap();
    // the dispatcher now holds `b` while it waits for the slot
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(scheduler.cancel(b).unwrap());
    assert!(scheduler.cancel(c).unwrap());
    for id in [b, c] {
        let task = scheduler.status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.terminal_reason, Some(TerminalReason::Cancelled));
        assert!(task.finished_at.is_some());
    }
    assert_eq!(scheduler.status(a).unwrap().status, TaskStatus::Running);
    assert_eq!(scheduler.summary().cancelled, 2);

    assert!(scheduler.cancel(a).unwrap());
    assert_eq!(finish(&scheduler, a).await.status, TaskStatus::Cancelled);
    // give the dispatcher a chance to drain the cancelled jobs
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(model.calls_for("queued first"), 0);
    assert_eq!(model.calls_for("queued second"), 0);
    assert!(scheduler.steps_since(b, 0).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_sequence_lets_the_sequence_finish() {
    let goal = "slow drag";
    let model = ScriptedModel::new();
    model.script(goal, vec![reply(&drag(10, 10, 40, 40)), reply(&click(5, 5)), reply(&done("never"))]);
    let (pressed_tx, mut pressed) = tokio::sync::mpsc::unbounded_channel();
    let executor = RecordingExecutor::slow_with_hook(Duration::from_millis(30), move |op| {
        if matches!(op, InputOp::ButtonDown { .. }) {
            let _ = pressed_tx.send(());
        }
    });
    let scheduler = scheduler(
        config(),
        FakeScreen::new(noise_frame(WIDTH, HEIGHT, 25)),
        model,
        executor.clone(),
        TemplateLibrary::new(),
    );

    let id = scheduler.submit(goal, None).unwrap();
    tokio::time::timeout(Duration::from_secs(5), pressed.recv()).await.unwrap().unwrap();
    assert!(scheduler.cancel(id).unwrap());

    let task = finish(&scheduler, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.steps.len(), 1);

    let ops = executor.ops();
    assert_eq!(ops.len(), 4, "sequence cut short: {ops:?}");
    assert!(matches!(ops[0], InputOp::MoveTo { x: 10, y: 10 }));
    assert!(matches!(ops[1], InputOp::ButtonDown { .. }));
    assert!(matches!(ops[2], InputOp::MoveTo { x: 40, y: 40 }));
    assert!(matches!(ops[3], InputOp::ButtonUp { .. }));
}

#[tokio::test]
async fn cancel_interrupts_a_long_wait() {
    let goal = "wait a long time";
    let model = ScriptedModel::new();
    model.script(goal, vec![reply(r#"{"thought": "loading", "action": {"type": "wait", "ms": 1800}}"#)]);
    let scheduler = blank_scheduler(model);

    let id = scheduler.submit(goal, None).unwrap();
    let mut rx = scheduler.watch(id).unwrap();
    rx.wait_for(|t| t.status == TaskStatus::Running).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled_at = Instant::now();
    assert!(scheduler.cancel(id).unwrap());
    let task = finish(&scheduler, id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_millis(800), "wait ignored the cancel");
}

#[tokio::test]
async fn subscription_sees_only_its_own_task() {
    let mine = "watched goal";
    let other = "unwatched goal";
    let model = ScriptedModel::new();
    model.script(mine, vec![reply(&click(5, 5)), reply(&done("mine"))]);
    model.script(other, vec![reply(&click(6, 6)), reply(&done("other"))]);
    let scheduler = blank_scheduler(model);

    let a = scheduler.submit(mine, None).unwrap();
    let mut sub = scheduler.subscribe(a).unwrap();
    let b = scheduler.submit(other, None).unwrap();
    assert!(matches!(scheduler.subscribe(TaskId::new()), Err(DeskPilotError::UnknownTask(_))));

    let mut steps = 0;
    let mut saw_running = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.task_id(), a);
        match event {
            TaskEvent::StepAppended { .. } => steps += 1,
            TaskEvent::StatusChanged { status: TaskStatus::Running, .. } => saw_running = true,
            TaskEvent::StatusChanged { status, .. } if status.is_terminal() => {
                assert_eq!(status, TaskStatus::Succeeded);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_running);
    assert_eq!(steps, 2);
    assert_eq!(finish(&scheduler, b).await.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn retryable_provider_failure_resumes_with_history() {
    let goal = "flaky provider";
    let model = ScriptedModel::new();
    model.script(
        goal,
        vec![reply(&click(5, 5)), provider_down(ProviderFailureKind::RateLimited), reply(&done("made it"))],
    );
    let scheduler = blank_scheduler(model.clone());
    let mut events = scheduler.subscribe_all();

    let id = scheduler.submit(goal, None).unwrap();
    let task = finish(&scheduler, id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.steps.len(), 2);
    assert_eq!(model.calls_for(goal), 3);

    let mut retried = false;
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::Retrying { task_id, attempt, .. } = event {
            assert_eq!(task_id, id);
            assert_eq!(attempt, 1);
            retried = true;
        }
    }
    assert!(retried);
}

#[tokio::test]
async fn provider_retries_are_bounded() {
    let goal = "provider down";
    let model = ScriptedModel::new();
    model.script(goal, (0..10).map(|_| provider_down(ProviderFailureKind::Server)).collect());
    let scheduler = blank_scheduler(model.clone());

    let id = scheduler.submit(goal, None).unwrap();
    let task = finish(&scheduler, id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(matches!(
        task.terminal_reason,
        Some(TerminalReason::ProviderFailure { provider_kind: ProviderFailureKind::Server, .. })
    ));
    // first run plus two resumptions
    assert_eq!(model.calls_for(goal), 3);
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let goal = "bad key";
    let model = ScriptedModel::new();
    model.script(goal, vec![provider_down(ProviderFailureKind::Auth), reply(&done("unreachable"))]);
    let scheduler = blank_scheduler(model.clone());

    let id = scheduler.submit(goal, None).unwrap();
    let task = finish(&scheduler, id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(matches!(
        task.terminal_reason,
        Some(TerminalReason::ProviderFailure { provider_kind: ProviderFailureKind::Auth, .. })
    ));
    assert_eq!(model.calls_for(goal), 1);
}

#[tokio::test]
async fn full_queue_rejects_new_goals() {
    let mut cfg = config();
    cfg.scheduler.queue_capacity = 1;
    cfg.scheduler.max_concurrent_tasks = 1;
    let scheduler = scheduler(
        cfg,
        FakeScreen::new(noise_frame(WIDTH, HEIGHT, 23)),
        ScriptedModel::new(),
        RecordingExecutor::new(),
        TemplateLibrary::new(),
    );

    let first = scheduler.submit("first", None).unwrap();
    let err = scheduler.submit("second", None).unwrap_err();
    assert!(matches!(err, DeskPilotError::Scheduler(ref msg) if msg.contains("full")));

    assert_eq!(finish(&scheduler, first).await.status, TaskStatus::Succeeded);
    // room again once the dispatcher drained the queue
    let third = scheduler.submit("third", None).unwrap();
    assert_eq!(finish(&scheduler, third).await.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn submission_is_validated() {
    let scheduler = blank_scheduler(ScriptedModel::new());

    assert!(matches!(scheduler.submit("   ", None), Err(DeskPilotError::Scheduler(_))));
    assert!(scheduler.submit("goal", Some("nobody")).is_err());
    assert!(matches!(scheduler.status(TaskId::new()), Err(DeskPilotError::UnknownTask(_))));
    assert!(scheduler.list().is_empty());
}

#[tokio::test]
async fn list_and_summary_reflect_finished_tasks() {
    let model = ScriptedModel::new();
    model.script("gives up", vec![reply(r#"{"action": {"type": "fail", "reason": "no"}}"#)]);
    let scheduler = blank_scheduler(model);

    let ok = scheduler.submit("succeeds", None).unwrap();
    let bad = scheduler.submit("gives up", None).unwrap();
    finish(&scheduler, ok).await;
    finish(&scheduler, bad).await;

    let rows = scheduler.list();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().find(|r| r.id == ok).unwrap().status, TaskStatus::Succeeded);
    let failed = rows.iter().find(|r| r.id == bad).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.reason.as_deref().unwrap().contains("no"));

    let summary = scheduler.summary();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.total(), 2);

    let steps = scheduler.steps_since(ok, 0).unwrap();
    assert_eq!(steps.len(), 1);
    assert!(scheduler.steps_since(ok, 1).unwrap().is_empty());
}
