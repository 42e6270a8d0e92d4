use futures_util::StreamExt;

use crate::errors::DeskResult;
use crate::llm::prompt;
use crate::llm::providers::{missing_content, sanitize_for_log, send};
use crate::llm::registry::ProviderProfile;
use crate::llm::sse_parser;
use crate::llm::types::{ChatMessage, Completion, ModelRequest, StreamChunkKind, VisualContext};

/// Chat messages in OpenAI format: system, the user turn (with the frame as a data URL
/// for vision profiles), then one assistant/user pair per rejected reply.
pub fn build_messages(request: &ModelRequest) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(prompt::system_text(request))];
    let text = prompt::user_text(request);
    messages.push(match &request.visual {
        VisualContext::Image { png_base64, .. } => ChatMessage::user_with_image(text, png_base64),
        VisualContext::Elements(_) => ChatMessage::user(text),
    });
    for correction in &request.corrections {
        messages.push(ChatMessage::assistant(correction.previous_output.clone()));
        messages.push(ChatMessage::user(prompt::correction_text(&correction.error)));
    }
    messages
}

pub async fn complete(
    client: &reqwest::Client,
    profile: &ProviderProfile,
    api_key: &str,
    request: &ModelRequest,
) -> DeskResult<Completion> {
    let body = serde_json::json!({
        "model": profile.model,
        "messages": build_messages(request),
        "stream": profile.stream,
        "temperature": profile.temperature,
    });

    tracing::debug!(
        provider = %profile.name,
        model = %profile.model,
        stream = profile.stream,
        "sending LLM request"
    );
    tracing::debug!(body = %sanitize_for_log(&body), "request body (sanitized)");

    let url = format!("{}/chat/completions", profile.api_base);
    let response = send(client.post(&url).bearer_auth(api_key).json(&body), profile).await?;

    if profile.stream {
        handle_stream(response, profile).await
    } else {
        handle_json(response, profile).await
    }
}

/// Accumulate an SSE response into one completion.
async fn handle_stream(response: reqwest::Response, profile: &ProviderProfile) -> DeskResult<Completion> {
    let mut byte_stream = response.bytes_stream();
    let mut line_buf = String::new();
    let mut content = String::new();
    let mut reasoning_len = 0usize;

    'stream: while let Some(result) = byte_stream.next().await {
        let bytes = result.map_err(super::classify_transport)?;
        line_buf.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = line_buf.find('\n') {
            let line = line_buf[..pos].trim().to_string();
            line_buf.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            match sse_parser::parse_sse_line(&line) {
                Ok(Some(chunk)) => match chunk.kind {
                    StreamChunkKind::Content => content.push_str(&chunk.content),
                    StreamChunkKind::Reasoning => reasoning_len += chunk.content.len(),
                    StreamChunkKind::Done => break 'stream,
                },
                Ok(None) => {}
                Err(e) => tracing::debug!("SSE parse skipped: {e}"),
            }
        }
    }

    tracing::debug!(
        provider = %profile.name,
        content_len = content.len(),
        reasoning_len,
        "LLM stream complete"
    );
    if content.is_empty() {
        return Err(missing_content(&profile.name));
    }
    Ok(Completion { text: content, input_tokens: None, output_tokens: None })
}

async fn handle_json(response: reqwest::Response, profile: &ProviderProfile) -> DeskResult<Completion> {
    let json: serde_json::Value = response.json().await.map_err(super::classify_transport)?;
    let text = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| missing_content(&profile.name))?
        .to_string();
    Ok(Completion {
        text,
        input_tokens: json["usage"]["prompt_tokens"].as_u64(),
        output_tokens: json["usage"]["completion_tokens"].as_u64(),
    })
}
