pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;
pub mod scheduler;

use std::sync::Arc;

use crate::agent_engine::engine::AgentContext;
use crate::agent_engine::event_bus::EventBus;
use crate::config::AppConfig;
use crate::errors::DeskResult;
use crate::executor::device::{ActionExecutor, EnigoExecutor};
use crate::llm::gateway::{GatewaySettings, ModelGateway};
use crate::llm::prompt::PromptSettings;
use crate::llm::provider::ModelTransport;
use crate::llm::providers::HttpTransport;
use crate::llm::rate_limit::RateLimiter;
use crate::llm::registry::ProviderRegistry;
use crate::perception::library::TemplateLibrary;
use crate::perception::pipeline::ScreenPerception;
use crate::perception::screenshot::XcapCapture;
use crate::perception::traits::CaptureSource;
use crate::scheduler::{DeviceGate, Scheduler};

/// Install the global `tracing` subscriber. `RUST_LOG` wins; `info` otherwise.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// External collaborators a scheduler is assembled from.
pub struct Collaborators {
    pub capture: Arc<dyn CaptureSource>,
    pub transport: Arc<dyn ModelTransport>,
    pub executor: Arc<dyn ActionExecutor>,
    pub templates: TemplateLibrary,
}

/// Load `.env` and `config.toml`, then wire the real screen, HTTP and input backends.
pub fn bootstrap() -> DeskResult<Scheduler> {
    // .env is optional
    let _ = dotenvy::dotenv();
    let config = config::load_config()?;

    let templates = match &config.perception.template_dir {
        Some(dir) => TemplateLibrary::load_dir(dir)?,
        None => TemplateLibrary::new(),
    };
    let collaborators = Collaborators {
        capture: Arc::new(XcapCapture::new()),
        transport: Arc::new(HttpTransport::new()),
        executor: Arc::new(EnigoExecutor::spawn()?),
        templates,
    };
    build_scheduler(config, collaborators)
}

/// Assemble a scheduler from a parsed config and explicit collaborators.
/// Must be called inside a tokio runtime.
pub fn build_scheduler(config: AppConfig, collaborators: Collaborators) -> DeskResult<Scheduler> {
    let registry = ProviderRegistry::from_config(&config)?;
    let Collaborators { capture, transport, executor, templates } = collaborators;

    let settings = GatewaySettings {
        max_attempts: config.agent.max_decision_attempts,
        call_timeout: config.agent.decision_timeout(),
        prompt: PromptSettings {
            history_window: config.agent.history_window,
            summary_max_chars: config.agent.summary_max_chars,
            template_names: templates.names().into_iter().map(str::to_string).collect(),
        },
    };
    let gateway = ModelGateway::new(transport, Arc::new(RateLimiter::new()), settings);

    tracing::info!(
        providers = registry.list_names().len(),
        active = %registry.active_name(),
        templates = templates.len(),
        "deskpilot assembled"
    );

    let ctx = Arc::new(AgentContext {
        perception: Arc::new(ScreenPerception::new(capture, config.perception.clone())),
        gateway: Arc::new(gateway),
        templates: Arc::new(templates),
        gate: Arc::new(DeviceGate::new(executor)),
        config: config.agent.clone(),
        events: EventBus::default(),
    });
    Ok(Scheduler::new(ctx, registry, config.scheduler))
}
