#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{GrayImage, Rgba, RgbaImage};

use deskpilot_lib::config::{parse_config, AppConfig, CaptureTarget};
use deskpilot_lib::errors::{DeskPilotError, DeskResult, ExecutionError};
use deskpilot_lib::executor::device::ActionExecutor;
use deskpilot_lib::executor::input::InputOp;
use deskpilot_lib::llm::provider::ModelTransport;
use deskpilot_lib::llm::registry::ProviderProfile;
use deskpilot_lib::llm::types::{ModelRequest, ModelResponse, ProviderMeta};
use deskpilot_lib::perception::library::TemplateLibrary;
use deskpilot_lib::perception::traits::CaptureSource;
use deskpilot_lib::perception::types::{RawCapture, ScreenshotMeta};
use deskpilot_lib::scheduler::Scheduler;
use deskpilot_lib::{build_scheduler, Collaborators};

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;

pub const BASE_CONFIG: &str = r#"
[llm]
active_provider = "fake"

[llm.providers.fake]
adapter = "openai"
api_base = "http://127.0.0.1:9"
model = "fake-vision"

[perception]
capture_timeout_ms = 500
match_threshold = 0.9

[agent]
max_steps = 10
max_duration_secs = 30
max_decision_attempts = 3
verification_attempts = 2
verification_interval_ms = 10
max_consecutive_failures = 3
wait_for_poll_ms = 10
max_wait_for_ms = 2000
decision_timeout_ms = 2000
execution_timeout_ms = 2000

[scheduler]
queue_capacity = 4
max_concurrent_tasks = 2
provider_retry_attempts = 2
backoff_base_ms = 10
backoff_max_ms = 40
"#;

pub fn config() -> AppConfig {
    parse_config(BASE_CONFIG).unwrap()
}

/// Deterministic RGBA noise; different seeds never correlate.
pub fn noise_frame(width: u32, height: u32, seed: u64) -> RgbaImage {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    RgbaImage::from_fn(width, height, |_, _| {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let v = (state >> 33) as u8;
        Rgba([v, v.wrapping_mul(3), v.wrapping_add(71), 255])
    })
}

/// Grayscale crop of `frame`, used as a template that is present in it.
pub fn crop_template(frame: &RgbaImage, x: u32, y: u32, w: u32, h: u32) -> GrayImage {
    let gray = image::imageops::grayscale(frame);
    image::imageops::crop_imm(&gray, x, y, w, h).to_image()
}

/// Screen whose content tests swap at will.
pub struct FakeScreen {
    frame: Mutex<RgbaImage>,
    delay: Mutex<Option<Duration>>,
}

impl FakeScreen {
    pub fn new(frame: RgbaImage) -> Arc<Self> {
        Arc::new(Self { frame: Mutex::new(frame), delay: Mutex::new(None) })
    }

    pub fn show(&self, frame: RgbaImage) {
        *self.frame.lock().unwrap() = frame;
    }

    /// Make every grab take this long.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl CaptureSource for FakeScreen {
    async fn grab(&self, _target: &CaptureTarget) -> DeskResult<RawCapture> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let image = self.frame.lock().unwrap().clone();
        let meta = ScreenshotMeta::for_image(image.width(), image.height());
        Ok(RawCapture { image, meta })
    }
}

pub type Reply = DeskResult<String>;

/// Model backend replaying per-goal scripts. An exhausted script answers `done`.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<ModelRequest>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay: Some(delay), ..Self::default() })
    }

    pub fn script(&self, goal: &str, replies: Vec<Reply>) {
        self.scripts.lock().unwrap().insert(goal.to_string(), replies.into());
    }

    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, goal: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| r.goal == goal).count()
    }
}

#[async_trait]
impl ModelTransport for ScriptedModel {
    async fn complete(&self, profile: &ProviderProfile, request: &ModelRequest) -> DeskResult<ModelResponse> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.goal)
            .and_then(VecDeque::pop_front);
        let text = match next {
            Some(reply) => reply?,
            None => done("script exhausted"),
        };
        Ok(ModelResponse {
            raw_text: text,
            meta: ProviderMeta { provider: profile.name.clone(), model: profile.model.clone(), ..Default::default() },
        })
    }
}

pub fn reply(json: &str) -> Reply {
    Ok(json.to_string())
}

pub fn done(summary: &str) -> String {
    format!(r#"{{"thought": "finished", "action": {{"type": "done", "summary": "{summary}"}}}}"#)
}

pub fn click(x: i32, y: i32) -> String {
    format!(r#"{{"thought": "click it", "action": {{"type": "click", "x": {x}, "y": {y}}}}}"#)
}

pub fn drag(x1: i32, y1: i32, x2: i32, y2: i32) -> String {
    format!(
        r#"{{"thought": "drag", "action": {{"type": "drag", "x1": {x1}, "y1": {y1}, "x2": {x2}, "y2": {y2}}}}}"#
    )
}

pub fn provider_down(kind: deskpilot_lib::errors::ProviderFailureKind) -> Reply {
    Err(DeskPilotError::provider(kind, "scripted outage"))
}

type Hook = Box<dyn Fn(&InputOp) + Send + Sync>;

/// Executor that records every operation, optionally slowly, and can run a hook per op.
#[derive(Default)]
pub struct RecordingExecutor {
    ops: Mutex<Vec<InputOp>>,
    per_op_delay: Option<Duration>,
    hook: Option<Hook>,
    fail_on_button_up: bool,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(per_op_delay: Duration) -> Arc<Self> {
        Arc::new(Self { per_op_delay: Some(per_op_delay), ..Self::default() })
    }

    pub fn with_hook(hook: impl Fn(&InputOp) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { hook: Some(Box::new(hook)), ..Self::default() })
    }

    pub fn slow_with_hook(per_op_delay: Duration, hook: impl Fn(&InputOp) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { per_op_delay: Some(per_op_delay), hook: Some(Box::new(hook)), ..Self::default() })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { fail_on_button_up: true, ..Self::default() })
    }

    pub fn ops(&self) -> Vec<InputOp> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, op: &InputOp) -> Result<(), ExecutionError> {
        if let Some(delay) = self.per_op_delay {
            tokio::time::sleep(delay).await;
        }
        self.ops.lock().unwrap().push(op.clone());
        if self.fail_on_button_up && matches!(op, InputOp::ButtonUp { .. }) {
            return Err(ExecutionError::device("button stuck"));
        }
        if let Some(hook) = &self.hook {
            hook(op);
        }
        Ok(())
    }
}

pub fn scheduler(
    config: AppConfig,
    screen: Arc<FakeScreen>,
    model: Arc<ScriptedModel>,
    executor: Arc<RecordingExecutor>,
    templates: TemplateLibrary,
) -> Scheduler {
    build_scheduler(
        config,
        Collaborators { capture: screen, transport: model, executor, templates },
    )
    .unwrap()
}

/// Wait for a task with a ceiling so a hung loop fails the test instead of blocking it.
pub async fn finish(
    scheduler: &Scheduler,
    id: deskpilot_lib::agent_engine::state::TaskId,
) -> deskpilot_lib::agent_engine::state::Task {
    tokio::time::timeout(Duration::from_secs(10), scheduler.wait(id))
        .await
        .expect("task did not finish in time")
        .unwrap()
}
