pub mod anthropic;
pub mod ollama;
pub mod openai_compatible;

use std::time::Instant;

use async_trait::async_trait;

use crate::errors::{DeskPilotError, DeskResult, ProviderFailureKind};
use crate::llm::provider::ModelTransport;
use crate::llm::registry::{AdapterKind, ProviderProfile};
use crate::llm::types::{ModelRequest, ModelResponse, ProviderMeta};

/// Strings longer than this are replaced in logged request bodies.
const LOG_STRING_LIMIT: usize = 512;

/// HTTP transport for every adapter kind; the profile selects the wire format.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    async fn complete(&self, profile: &ProviderProfile, request: &ModelRequest) -> DeskResult<ModelResponse> {
        let started = Instant::now();
        let completion = match profile.adapter {
            AdapterKind::OpenAiCompatible => {
                let key = require_key(profile)?;
                openai_compatible::complete(&self.client, profile, &key, request).await?
            }
            AdapterKind::Anthropic => {
                let key = require_key(profile)?;
                anthropic::complete(&self.client, profile, &key, request).await?
            }
            AdapterKind::Ollama => ollama::complete(&self.client, profile, request).await?,
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            provider = %profile.name,
            model = %profile.model,
            latency_ms,
            content_len = completion.text.len(),
            "model reply received"
        );
        Ok(ModelResponse {
            raw_text: completion.text,
            meta: ProviderMeta {
                provider: profile.name.clone(),
                model: profile.model.clone(),
                latency_ms,
                input_tokens: completion.input_tokens,
                output_tokens: completion.output_tokens,
                attempt: 1,
            },
        })
    }
}

fn require_key(profile: &ProviderProfile) -> DeskResult<String> {
    profile.credentials.resolve().ok_or_else(|| {
        DeskPilotError::provider(
            ProviderFailureKind::Auth,
            format!("no API key configured for provider '{}'", profile.name),
        )
    })
}

/// Send a prepared request and classify transport and status failures.
pub(crate) async fn send(builder: reqwest::RequestBuilder, profile: &ProviderProfile) -> DeskResult<reqwest::Response> {
    let response = builder.timeout(profile.timeout).send().await.map_err(classify_transport)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let kind = ProviderFailureKind::from_status(status.as_u16());
    tracing::warn!(provider = %profile.name, %status, kind = %kind, "provider returned an error status");
    Err(DeskPilotError::provider(kind, format!("{status}: {}", truncate(&body, 300))))
}

pub(crate) fn classify_transport(err: reqwest::Error) -> DeskPilotError {
    let kind = if err.is_timeout() {
        ProviderFailureKind::Timeout
    } else {
        ProviderFailureKind::Transport
    };
    DeskPilotError::provider(kind, err.to_string())
}

/// Copy of a request body safe to log: base64 images and other huge strings are omitted.
pub(crate) fn sanitize_for_log(body: &serde_json::Value) -> String {
    fn scrub(v: &mut serde_json::Value) {
        match v {
            serde_json::Value::String(s) if s.len() > LOG_STRING_LIMIT => {
                *s = format!("<omitted {} bytes>", s.len());
            }
            serde_json::Value::Array(items) => items.iter_mut().for_each(scrub),
            serde_json::Value::Object(map) => map.values_mut().for_each(scrub),
            _ => {}
        }
    }
    let mut copy = body.clone();
    scrub(&mut copy);
    serde_json::to_string(&copy).unwrap_or_default()
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Reply text that is missing entirely is treated as a server-side fault.
pub(crate) fn missing_content(provider: &str) -> DeskPilotError {
    DeskPilotError::provider(
        ProviderFailureKind::Server,
        format!("provider '{provider}' returned no message content"),
    )
}
