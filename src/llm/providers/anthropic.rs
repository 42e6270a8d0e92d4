use serde_json::{json, Value};

use crate::errors::DeskResult;
use crate::llm::prompt;
use crate::llm::providers::{missing_content, sanitize_for_log, send};
use crate::llm::registry::ProviderProfile;
use crate::llm::types::{Completion, ModelRequest, VisualContext};

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// Messages API body: the system prompt is top-level and images are base64 source blocks.
pub fn build_body(profile: &ProviderProfile, request: &ModelRequest) -> Value {
    let mut user_content = Vec::new();
    if let VisualContext::Image { png_base64, .. } = &request.visual {
        user_content.push(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": "image/png", "data": png_base64},
        }));
    }
    user_content.push(json!({"type": "text", "text": prompt::user_text(request)}));

    let mut messages = vec![json!({"role": "user", "content": user_content})];
    for correction in &request.corrections {
        messages.push(json!({"role": "assistant", "content": correction.previous_output}));
        messages.push(json!({"role": "user", "content": prompt::correction_text(&correction.error)}));
    }

    json!({
        "model": profile.model,
        "max_tokens": MAX_TOKENS,
        "temperature": profile.temperature,
        "system": prompt::system_text(request),
        "messages": messages,
    })
}

pub async fn complete(
    client: &reqwest::Client,
    profile: &ProviderProfile,
    api_key: &str,
    request: &ModelRequest,
) -> DeskResult<Completion> {
    let body = build_body(profile, request);
    tracing::debug!(provider = %profile.name, model = %profile.model, "sending Anthropic request");
    tracing::debug!(body = %sanitize_for_log(&body), "request body (sanitized)");

    let url = format!("{}/v1/messages", profile.api_base);
    let builder = client
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", API_VERSION)
        .json(&body);
    let response = send(builder, profile).await?;
    let json: Value = response.json().await.map_err(super::classify_transport)?;

    let text = json["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|t| !t.is_empty())
        .ok_or_else(|| missing_content(&profile.name))?;

    Ok(Completion {
        text,
        input_tokens: json["usage"]["input_tokens"].as_u64(),
        output_tokens: json["usage"]["output_tokens"].as_u64(),
    })
}
