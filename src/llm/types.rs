use serde::{Deserialize, Serialize};

use crate::agent_engine::state::{Action, DecisionRecord, Expectation};

/// OpenAI-style chat message, also the common shape the other adapters start from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: "system".into(), content: MessageContent::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: "user".into(), content: MessageContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: MessageContent::Text(text.into()) }
    }

    pub fn user_with_image(text: impl Into<String>, png_base64: &str) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: format!("data:image/png;base64,{png_base64}") },
                },
                ContentPart::Text { text: text.into() },
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub kind: StreamChunkKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunkKind {
    Reasoning,
    Content,
    Done,
}

/// How the current frame is shown to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum VisualContext {
    /// Vision-capable profiles get the frame itself.
    Image { png_base64: String, width: u32, height: u32 },
    /// Text-only profiles get the recognized element list (possibly empty).
    Elements(String),
}

/// A rejected reply and the reason, replayed to the model on the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub previous_output: String,
    pub error: String,
}

/// Provider-independent request. Adapters translate it into their wire format.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_context: String,
    pub goal: String,
    pub history_window: String,
    pub visual: VisualContext,
    pub output_schema: String,
    pub corrections: Vec<Correction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMeta {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// 1-based model call within the decision that produced this response.
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub raw_text: String,
    pub meta: ProviderMeta,
}

/// Text and token usage as returned by one adapter call.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// A parsed decision together with the reply it came from.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub rationale: String,
    pub expect: Option<Expectation>,
    pub raw_text: String,
    pub meta: ProviderMeta,
}

impl Decision {
    pub fn record(&self) -> DecisionRecord {
        DecisionRecord {
            action: self.action.clone(),
            rationale: self.rationale.clone(),
            expect: self.expect.clone(),
        }
    }
}
