use pulse_core::{PulseError, Result, StateTransitionRequest};
use serde_json::Value;

/// Turn an engine reply into a transition request.
///
/// Accepts a bare JSON object, an object wrapped as `{"transition": {...}}`,
/// or either of those inside a fenced code block. Anything else is an
/// `EngineParse` error, which the runtime treats like a failed call.
pub fn parse_transition_request(body: &str) -> Result<StateTransitionRequest> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(PulseError::EngineParse("empty response".into()));
    }
    let json_text = fenced_block(trimmed).unwrap_or(trimmed);

    let value: Value = serde_json::from_str(json_text)
        .map_err(|e| PulseError::EngineParse(format!("not JSON: {e}")))?;

    let value = match value {
        Value::Object(mut map) if map.contains_key("transition") => {
            map.remove("transition").unwrap_or(Value::Null)
        }
        other => other,
    };
    if !value.is_object() {
        return Err(PulseError::EngineParse("expected a JSON object".into()));
    }

    serde_json::from_value(value).map_err(|e| PulseError::EngineParse(e.to_string()))
}

/// Contents of the first ``` fenced block, if any.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an info string such as `json`.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}
