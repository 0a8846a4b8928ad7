//! Conversion layer for provider-specific tool-call shapes.
//!
//! Assistant outputs vary across LLM vendors; everything is normalized to the
//! canonical `{toolCallId, name, arguments:object}` before dispatch. Also
//! home to the canonical-JSON helpers used for loop-breaker args hashing.

use crate::conversation::ToolCall;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

/// Parse a single raw tool-call value in any of the recognized shapes:
///
/// 1. `{type:"function", function:{name, arguments:jsonString}}`
/// 2. `{type:"tool_use", id, name, input:object}`
/// 3. `{name, args}`
/// 4. `{name, parameters}`
///
/// Argument strings that fail JSON parsing fall back to `{}` with a warning.
/// A missing id gets a generated one.
pub fn parse_tool_call_value(raw: &Value) -> Option<ToolCall> {
    let obj = raw.as_object()?;

    // Shape 1: OpenAI-style function call with stringified arguments.
    if let Some(function) = obj.get("function").and_then(Value::as_object) {
        let name = function.get("name")?.as_str()?.to_string();
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) => parse_arguments_string(&name, s),
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => Value::Object(serde_json::Map::new()),
        };
        return Some(ToolCall {
            tool_call_id: id_or_generated(obj.get("id")),
            name,
            arguments,
        });
    }

    // Shape 2: Anthropic-style tool_use block.
    if obj.get("type").and_then(Value::as_str) == Some("tool_use") {
        let name = obj.get("name")?.as_str()?.to_string();
        let arguments = obj.get("input").cloned().unwrap_or(Value::Object(serde_json::Map::new()));
        return Some(ToolCall {
            tool_call_id: id_or_generated(obj.get("id")),
            name,
            arguments,
        });
    }

    // Shapes 3 and 4: bare name + args/parameters.
    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        let arguments = obj
            .get("args")
            .or_else(|| obj.get("parameters"))
            .cloned()
            .map(|v| match v {
                Value::String(s) => parse_arguments_string(name, &s),
                other => other,
            })
            .unwrap_or(Value::Object(serde_json::Map::new()));
        return Some(ToolCall {
            tool_call_id: id_or_generated(obj.get("id")),
            name: name.to_string(),
            arguments,
        });
    }

    None
}

/// Parse an array (or single object) of raw tool calls, skipping anything
/// unrecognizable.
pub fn parse_tool_calls(raw: &Value) -> Vec<ToolCall> {
    match raw {
        Value::Array(items) => items.iter().filter_map(parse_tool_call_value).collect(),
        Value::Object(_) => parse_tool_call_value(raw).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn id_or_generated(id: Option<&Value>) -> String {
    id.and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()))
}

fn parse_arguments_string(tool_name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!(
                "tool call '{}': non-object arguments {}, wrapping",
                tool_name, other
            );
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other);
            Value::Object(map)
        }
        Err(e) => {
            warn!(
                "tool call '{}': malformed arguments JSON ({}), falling back to empty object",
                tool_name, e
            );
            Value::Object(serde_json::Map::new())
        }
    }
}

/// Produce a canonical JSON string with object keys sorted recursively.
/// Logically identical arguments canonicalize identically regardless of key
/// insertion order.
///
/// Written directly into the output buffer: objects are walked as sorted
/// entry slices, so no intermediate re-keyed `Value` tree is built.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by_key(|(key, _)| *key);
            out.push('{');
            for (i, (key, entry)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key escaping must match serde's, so keys containing quotes
                // or control characters stay valid JSON.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(entry, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).unwrap_or_default()),
    }
}

/// Hash of `(tool name, canonical arguments)` used by the loop breaker.
/// First 16 hex chars of SHA-256, matching the code-hash convention.
pub fn args_hash(name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_json(arguments).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
