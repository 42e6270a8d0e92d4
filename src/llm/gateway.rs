use std::sync::Arc;
use std::time::Duration;

use crate::agent_engine::state::Step;
use crate::errors::{DeskPilotError, DeskResult, ProviderFailureKind};
use crate::llm::parse::parse_decision;
use crate::llm::prompt::{self, PromptSettings};
use crate::llm::provider::ModelTransport;
use crate::llm::rate_limit::RateLimiter;
use crate::llm::registry::ProviderProfile;
use crate::llm::types::{Correction, Decision};
use crate::perception::types::ScreenState;

/// Longest slice of a rejected reply echoed back in a corrective re-prompt.
const MAX_ECHOED_OUTPUT: usize = 2_000;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Model calls per decision, the first one included.
    pub max_attempts: u32,
    /// Ceiling for a single model call.
    pub call_timeout: Duration,
    pub prompt: PromptSettings,
}

/// Uniform "what next?" over every configured backend.
pub struct ModelGateway {
    transport: Arc<dyn ModelTransport>,
    limiter: Arc<RateLimiter>,
    settings: GatewaySettings,
}

impl ModelGateway {
    pub fn new(transport: Arc<dyn ModelTransport>, limiter: Arc<RateLimiter>, settings: GatewaySettings) -> Self {
        Self { transport, limiter, settings }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Ask the profile's backend for the next action.
    ///
    /// Unusable replies are retried with a corrective re-prompt until `max_attempts`
    /// calls have been made, then reported as `DecisionFailure`. Provider failures are
    /// returned immediately; their retry policy belongs to the scheduler.
    pub async fn decide(
        &self,
        goal: &str,
        history: &[Step],
        state: &ScreenState,
        profile: &ProviderProfile,
    ) -> DeskResult<Decision> {
        let mut request = prompt::build_request(goal, history, state, profile, &self.settings.prompt)?;
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.limiter.acquire(&profile.name, &profile.rate_limit).await;

            let call = self.transport.complete(profile, &request);
            let mut response = match tokio::time::timeout(self.settings.call_timeout, call).await {
                Ok(res) => res?,
                Err(_) => {
                    tracing::warn!(provider = %profile.name, attempt, "model call timed out");
                    return Err(DeskPilotError::provider(
                        ProviderFailureKind::Timeout,
                        format!("no reply within {}ms", self.settings.call_timeout.as_millis()),
                    ));
                }
            };
            response.meta.attempt = attempt;

            match parse_decision(&response.raw_text) {
                Ok(parsed) => {
                    tracing::info!(
                        provider = %profile.name,
                        attempt,
                        action = %parsed.action.describe(),
                        latency_ms = response.meta.latency_ms,
                        "decision received"
                    );
                    return Ok(Decision {
                        action: parsed.action,
                        rationale: parsed.rationale,
                        expect: parsed.expect,
                        raw_text: response.raw_text,
                        meta: response.meta,
                    });
                }
                Err(reason) => {
                    tracing::warn!(
                        provider = %profile.name,
                        attempt,
                        max_attempts,
                        error = %reason,
                        "unusable model output"
                    );
                    request.corrections.push(Correction {
                        previous_output: response.raw_text.chars().take(MAX_ECHOED_OUTPUT).collect(),
                        error: reason.clone(),
                    });
                    last_error = reason;
                }
            }
        }

        Err(DeskPilotError::DecisionFailure { attempts: max_attempts, detail: last_error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};

    use crate::agent_engine::state::Action;
    use crate::config::RateLimitPolicy;
    use crate::llm::registry::{AdapterKind, Capabilities, CredentialRef};
    use crate::llm::types::{ModelRequest, ModelResponse, ProviderMeta, VisualContext};
    use crate::perception::types::ScreenshotMeta;

    struct Scripted {
        replies: Mutex<VecDeque<DeskResult<String>>>,
        seen: Mutex<Vec<ModelRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<DeskResult<String>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), seen: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelTransport for Scripted {
        async fn complete(&self, profile: &ProviderProfile, request: &ModelRequest) -> DeskResult<ModelResponse> {
            self.seen.lock().unwrap().push(request.clone());
            let text = self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Ok("nothing".into()))?;
            Ok(ModelResponse {
                raw_text: text,
                meta: ProviderMeta { provider: profile.name.clone(), model: profile.model.clone(), ..Default::default() },
            })
        }
    }

    fn profile(vision: bool) -> ProviderProfile {
        ProviderProfile {
            name: "fake".into(),
            display_name: "fake".into(),
            adapter: AdapterKind::OpenAiCompatible,
            api_base: "http://localhost".into(),
            model: "m".into(),
            temperature: 0.0,
            capabilities: Capabilities { vision, max_context_tokens: 32_000 },
            credentials: CredentialRef::none(),
            rate_limit: RateLimitPolicy::default(),
            timeout: Duration::from_secs(5),
            stream: false,
        }
    }

    fn state() -> ScreenState {
        ScreenState {
            frame: Arc::new(RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 255]))),
            elements: None,
            captured_at: chrono::Utc::now(),
            meta: ScreenshotMeta::for_image(8, 8),
        }
    }

    fn gateway(transport: Arc<Scripted>, attempts: u32) -> ModelGateway {
        ModelGateway::new(
            transport,
            Arc::new(RateLimiter::new()),
            GatewaySettings {
                max_attempts: attempts,
                call_timeout: Duration::from_secs(5),
                prompt: PromptSettings { history_window: 4, summary_max_chars: 200, template_names: vec![] },
            },
        )
    }

    #[tokio::test]
    async fn malformed_output_uses_exactly_the_configured_attempts() {
        let transport = Scripted::new(vec![Ok("nope".into()), Ok("still nope".into()), Ok("{broken".into())]);
        let gw = gateway(transport.clone(), 3);
        let err = gw.decide("goal", &[], &state(), &profile(true)).await.unwrap_err();
        assert!(matches!(err, DeskPilotError::DecisionFailure { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);

        let seen = transport.seen.lock().unwrap();
        assert!(seen[0].corrections.is_empty());
        assert_eq!(seen[2].corrections.len(), 2);
        assert_eq!(seen[2].corrections[1].previous_output, "still nope");
    }

    #[tokio::test]
    async fn corrective_reprompt_recovers() {
        let transport = Scripted::new(vec![
            Ok("clicking now".into()),
            Ok(r#"{"thought":"t","action":{"type":"wait","ms":10}}"#.into()),
        ]);
        let gw = gateway(transport.clone(), 3);
        let decision = gw.decide("goal", &[], &state(), &profile(true)).await.unwrap();
        assert_eq!(decision.action, Action::Wait { ms: 10 });
        assert_eq!(decision.meta.attempt, 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn provider_failures_are_not_retried_here() {
        let transport = Scripted::new(vec![Err(DeskPilotError::provider(ProviderFailureKind::Server, "502"))]);
        let gw = gateway(transport.clone(), 3);
        let err = gw.decide("goal", &[], &state(), &profile(true)).await.unwrap_err();
        assert!(err.is_retryable_provider_failure());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn text_only_profile_gets_element_list() {
        let transport = Scripted::new(vec![Ok(r#"{"type":"done","summary":"ok"}"#.into())]);
        let gw = gateway(transport.clone(), 1);
        gw.decide("goal", &[], &state(), &profile(false)).await.unwrap();
        let seen = transport.seen.lock().unwrap();
        assert!(matches!(seen[0].visual, VisualContext::Elements(_)));
    }
}
