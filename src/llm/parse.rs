use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::agent_engine::state::{Action, Expectation};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    pub action: Action,
    pub rationale: String,
    pub expect: Option<Expectation>,
}

fn fence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").ok())
        .as_ref()
}

/// Pull the JSON object out of a model reply: a fenced block if present,
/// otherwise the outermost `{ ... }` span.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(m) = fence_re().and_then(|re| re.captures(text)).and_then(|c| c.get(1)) {
        return Some(m.as_str());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse a reply into an action. The error string is fed back to the model verbatim.
pub fn parse_decision(text: &str) -> Result<ParsedDecision, String> {
    let json_text = extract_json(text).ok_or_else(|| "no JSON object found in reply".to_string())?;
    let value: Value = serde_json::from_str(json_text).map_err(|e| format!("invalid JSON: {e}"))?;
    let obj = value.as_object().ok_or_else(|| "reply JSON is not an object".to_string())?;

    let rationale = ["thought", "rationale", "reasoning"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    // Either {"action": {...}} or the action object at top level.
    let action_value = match obj.get("action") {
        Some(a @ Value::Object(_)) => a.clone(),
        Some(Value::String(kind)) => {
            let mut flat = obj.clone();
            flat.insert("type".into(), Value::String(kind.clone()));
            Value::Object(flat)
        }
        Some(_) => return Err("\"action\" must be an object".to_string()),
        None if obj.contains_key("type") => value.clone(),
        None => return Err("missing \"action\" field".to_string()),
    };
    let action: Action =
        serde_json::from_value(action_value).map_err(|e| format!("action does not match the schema: {e}"))?;

    let expect = match obj.get("expect") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<Expectation>(v.clone())
                .map_err(|e| format!("\"expect\" does not match the schema: {e}"))?,
        ),
    };

    Ok(ParsedDecision { action, rationale, expect })
}
