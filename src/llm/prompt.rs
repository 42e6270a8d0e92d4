//! Prompt assembly: goal, a bounded history window and the current visual context.

use std::io::Cursor;

use base64::Engine;
use image::{ImageFormat, RgbaImage};

use crate::agent_engine::state::Step;
use crate::errors::DeskResult;
use crate::llm::registry::ProviderProfile;
use crate::llm::types::{ModelRequest, VisualContext};
use crate::perception::types::{ScreenState, UIElement};

/// Rough chars-per-token ratio used to keep the history inside the model context.
const CHARS_PER_TOKEN: usize = 4;
/// Context share reserved for instructions, element list and reply.
const RESERVED_TOKENS: usize = 2_000;

pub const SYSTEM_CONTEXT: &str = "\
You operate a desktop computer to accomplish the user's goal. Each turn you see the \
current screen and a log of the steps taken so far, and you choose exactly ONE next action. \
Coordinates are pixels in the screenshot, origin at the top-left corner. \
Only reply `done` once the goal is visibly accomplished. Reply `fail` if the goal cannot be reached.";

pub const OUTPUT_SCHEMA: &str = r#"Reply with a single JSON object and nothing else:
{
  "thought": "<short reasoning about what you see and why this action>",
  "action": <one of:
    {"type": "click", "x": int, "y": int, "button": "left"|"right"|"middle", "clicks": 1|2}
    {"type": "drag", "x1": int, "y1": int, "x2": int, "y2": int}
    {"type": "type_text", "text": string}
    {"type": "hotkey", "keys": ["ctrl", "s"]}
    {"type": "scroll", "direction": "up"|"down"|"left"|"right", "clicks": int}
    {"type": "wait", "ms": int}
    {"type": "wait_for", "template": string, "timeout_ms": int}
    {"type": "done", "summary": string}
    {"type": "fail", "reason": string}>,
  "expect": {"template": string, "timeout_ms": int}   (optional: what should appear after the action)
}"#;

/// Knobs for [`build_request`], taken from the agent configuration.
#[derive(Debug, Clone)]
pub struct PromptSettings {
    pub history_window: usize,
    pub summary_max_chars: usize,
    /// Names usable in `wait_for` and `expect`.
    pub template_names: Vec<String>,
}

pub fn build_request(
    goal: &str,
    steps: &[Step],
    state: &ScreenState,
    profile: &ProviderProfile,
    settings: &PromptSettings,
) -> DeskResult<ModelRequest> {
    let visual = if profile.capabilities.vision {
        VisualContext::Image {
            png_base64: encode_png_base64(&state.frame)?,
            width: state.frame.width(),
            height: state.frame.height(),
        }
    } else {
        VisualContext::Elements(render_elements(state.elements.as_deref().unwrap_or(&[])))
    };

    let mut budget_chars = (profile.capabilities.max_context_tokens as usize)
        .saturating_sub(RESERVED_TOKENS)
        * CHARS_PER_TOKEN;
    if let VisualContext::Elements(text) = &visual {
        budget_chars = budget_chars.saturating_sub(text.len());
    }
    let history_window = render_history_within(steps, settings, budget_chars);

    let mut system_context = SYSTEM_CONTEXT.to_string();
    if !settings.template_names.is_empty() {
        system_context.push_str("\nKnown templates for wait_for / expect: ");
        system_context.push_str(&settings.template_names.join(", "));
    }

    Ok(ModelRequest {
        system_context,
        goal: goal.to_string(),
        history_window,
        visual,
        output_schema: OUTPUT_SCHEMA.to_string(),
        corrections: Vec::new(),
    })
}

/// Render the history, shrinking the verbatim window until it fits `budget_chars`.
/// At least the most recent step always stays verbatim.
fn render_history_within(steps: &[Step], settings: &PromptSettings, budget_chars: usize) -> String {
    let mut window = settings.history_window.max(1);
    loop {
        let text = render_history(steps, window, settings.summary_max_chars);
        if text.len() <= budget_chars || window <= 1 {
            return text;
        }
        window -= 1;
    }
}

/// Keep the last `window` steps verbatim and fold everything older into one note.
pub fn render_history(steps: &[Step], window: usize, summary_max_chars: usize) -> String {
    if steps.is_empty() {
        return "No steps taken yet.".to_string();
    }
    let split = steps.len().saturating_sub(window);
    let (older, recent) = steps.split_at(split);

    let mut out = String::new();
    if !older.is_empty() {
        let note = older
            .iter()
            .map(|s| format!("#{} {} -> {}", s.index + 1, s.decision.action.describe(), short_outcome(s)))
            .collect::<Vec<_>>()
            .join("; ");
        out.push_str(&format!("Summary of steps 1-{}: ", older.len()));
        out.push_str(&truncate_chars(&note, summary_max_chars));
        out.push('\n');
    }
    for step in recent {
        out.push_str(&format!(
            "Step {}: {}\n  thought: {}\n  result: {}\n",
            step.index + 1,
            step.decision.action.describe(),
            step.decision.rationale.trim(),
            step.outcome.describe(),
        ));
    }
    out
}

fn short_outcome(step: &Step) -> &'static str {
    if step.outcome.is_failure() {
        "failed"
    } else {
        "ok"
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// One line per element: `[id] kind "label" (conf%) @ x,y wxh`.
pub fn render_elements(elements: &[UIElement]) -> String {
    if elements.is_empty() {
        return "No UI elements were recognized on screen.".to_string();
    }
    let mut out = String::from("UI elements on screen:\n");
    for el in elements {
        let kind = serde_json::to_value(&el.node_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".into());
        let label = el.content.as_deref().unwrap_or("");
        out.push_str(&format!(
            "[{}] {} \"{}\" ({:.0}%) @ {},{} {}x{}",
            el.id,
            kind,
            label,
            el.confidence * 100.0,
            el.bbox.x,
            el.bbox.y,
            el.bbox.width,
            el.bbox.height
        ));
        if let Some(parent) = &el.parent_id {
            out.push_str(&format!(" in [{parent}]"));
        }
        out.push('\n');
    }
    out
}

pub fn encode_png_base64(frame: &RgbaImage) -> DeskResult<String> {
    let mut buf = Cursor::new(Vec::new());
    frame.write_to(&mut buf, ImageFormat::Png)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

/// Text of the user turn shared by every adapter.
pub fn user_text(request: &ModelRequest) -> String {
    let mut text = format!("Goal: {}\n\nHistory:\n{}\n", request.goal, request.history_window);
    match &request.visual {
        VisualContext::Image { width, height, .. } => {
            text.push_str(&format!("\nThe attached screenshot is {width}x{height} pixels.\n"));
        }
        VisualContext::Elements(list) => {
            text.push('\n');
            text.push_str(list);
        }
    }
    text
}

/// System prompt shared by every adapter.
pub fn system_text(request: &ModelRequest) -> String {
    format!("{}\n\n{}", request.system_context, request.output_schema)
}

pub fn correction_text(error: &str) -> String {
    format!(
        "Your previous reply could not be used ({error}). \
         Reply again with exactly one JSON object following the required format."
    )
}
