use serde_json::{json, Value};

use crate::errors::DeskResult;
use crate::llm::prompt;
use crate::llm::providers::{missing_content, sanitize_for_log, send};
use crate::llm::registry::ProviderProfile;
use crate::llm::types::{Completion, ModelRequest, VisualContext};

/// `/api/chat` body; images ride along on the user message as raw base64.
pub fn build_body(profile: &ProviderProfile, request: &ModelRequest) -> Value {
    let mut user = json!({"role": "user", "content": prompt::user_text(request)});
    if let VisualContext::Image { png_base64, .. } = &request.visual {
        user["images"] = json!([png_base64]);
    }
    let mut messages = vec![json!({"role": "system", "content": prompt::system_text(request)}), user];
    for correction in &request.corrections {
        messages.push(json!({"role": "assistant", "content": correction.previous_output}));
        messages.push(json!({"role": "user", "content": prompt::correction_text(&correction.error)}));
    }
    json!({
        "model": profile.model,
        "messages": messages,
        "stream": false,
        "options": {"temperature": profile.temperature},
    })
}

pub async fn complete(
    client: &reqwest::Client,
    profile: &ProviderProfile,
    request: &ModelRequest,
) -> DeskResult<Completion> {
    let body = build_body(profile, request);
    tracing::debug!(provider = %profile.name, model = %profile.model, "sending Ollama request");
    tracing::debug!(body = %sanitize_for_log(&body), "request body (sanitized)");

    let url = format!("{}/api/chat", profile.api_base);
    let response = send(client.post(&url).json(&body), profile).await?;
    let json: Value = response.json().await.map_err(super::classify_transport)?;
    let text = json["message"]["content"]
        .as_str()
        .ok_or_else(|| missing_content(&profile.name))?
        .to_string();
    Ok(Completion {
        text,
        input_tokens: json["prompt_eval_count"].as_u64(),
        output_tokens: json["eval_count"].as_u64(),
    })
}
