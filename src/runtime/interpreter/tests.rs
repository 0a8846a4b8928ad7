use super::*;
use serde_json::json;

fn tools() -> Vec<String> {
    vec!["messaging_send".to_string(), "tools_discover".to_string()]
}

#[test]
fn detects_fenced_json_call() {
    let text = "I'll reach out:\n```json\n{\"name\": \"messaging_send\", \"args\": {\"targetAgentId\": \"a2\", \"message\": \"hi\"}}\n```";
    let call = detect_intended_tool_call(text, &tools()).unwrap();
    assert_eq!(call.name, "messaging_send");
    assert_eq!(call.arguments["targetAgentId"], "a2");
    assert!(call.tool_call_id.starts_with("interp_"));
}

#[test]
fn detects_bare_json_call() {
    let text = "{\"name\": \"tools_discover\", \"parameters\": {\"category\": \"messaging\"}}";
    let call = detect_intended_tool_call(text, &tools()).unwrap();
    assert_eq!(call.name, "tools_discover");
    assert_eq!(call.arguments, json!({ "category": "messaging" }));
}

#[test]
fn detects_call_expression_on_own_line() {
    let text = "Let me check.\nmessaging_send({\"targetAgentId\": \"a2\", \"message\": \"ping\"})";
    let call = detect_intended_tool_call(text, &tools()).unwrap();
    assert_eq!(call.name, "messaging_send");
}

#[test]
fn unknown_tools_are_ignored() {
    let text = "{\"name\": \"filesystem_write\", \"args\": {}}";
    assert!(detect_intended_tool_call(text, &tools()).is_none());
}

#[test]
fn prose_is_not_a_tool_call() {
    for text in [
        "I would use messaging_send here if needed.",
        "The answer is 42.",
        "Calling messaging_send(now) without JSON args",
    ] {
        assert!(
            detect_intended_tool_call(text, &tools()).is_none(),
            "false positive on: {text}"
        );
    }
}
