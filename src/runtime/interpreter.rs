use crate::conversation::ToolCall;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;
use uuid::Uuid;

/// Fallback detector for assistant text that structurally intends a tool
/// call without emitting one. Off by default; when enabled, a match is
/// converted to a canonical call and recorded with `source:"interpreted"`.
///
/// Two shapes are recognized:
/// 1. A fenced or bare JSON object `{"name": ..., "args"|"parameters"|"arguments": {...}}`
/// 2. A call expression `tool_name({...})` on its own line
pub fn detect_intended_tool_call(text: &str, known_tools: &[String]) -> Option<ToolCall> {
    if let Some(call) = detect_json_shape(text, known_tools) {
        return Some(call);
    }
    detect_call_expression(text, known_tools)
}

fn detect_json_shape(text: &str, known_tools: &[String]) -> Option<ToolCall> {
    // Try fenced blocks first, then the whole trimmed text.
    let mut candidates: Vec<&str> = Vec::new();
    for (i, part) in text.split("```").enumerate() {
        if i % 2 == 1 {
            candidates.push(part.trim_start_matches("json").trim());
        }
    }
    candidates.push(text.trim());

    for candidate in candidates {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(name) = value["name"].as_str() else {
            continue;
        };
        if !known_tools.iter().any(|t| t == name) {
            continue;
        }
        let arguments = value
            .get("args")
            .or_else(|| value.get("parameters"))
            .or_else(|| value.get("arguments"))
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        debug!("interpreter: detected JSON-shaped call to '{}'", name);
        return Some(ToolCall {
            tool_call_id: format!("interp_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            arguments,
        });
    }
    None
}

fn call_expression_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?m)^\s*([a-z][a-z0-9_]*)\s*\((\{.*\})\)\s*$")
            .expect("call pattern must compile")
    })
}

fn detect_call_expression(text: &str, known_tools: &[String]) -> Option<ToolCall> {
    for caps in call_expression_regex().captures_iter(text) {
        let name = &caps[1];
        if !known_tools.iter().any(|t| t == name) {
            continue;
        }
        let Ok(arguments) = serde_json::from_str::<Value>(&caps[2]) else {
            continue;
        };
        debug!("interpreter: detected call expression '{}'", name);
        return Some(ToolCall {
            tool_call_id: format!("interp_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            arguments,
        });
    }
    None
}

#[cfg(test)]
mod tests;
