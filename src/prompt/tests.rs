use super::*;
use serde_json::json;

fn ctx() -> TemplateContext {
    TemplateContext {
        agent_id: "agent-1".to_string(),
        channel_id: "ch-1".to_string(),
        channel_name: "research".to_string(),
        active_agents: vec!["agent-1".to_string()],
        llm_provider: "default".to_string(),
        llm_model: "model-a".to_string(),
        system_llm_enabled: true,
        orpar_phase: "observation".to_string(),
    }
}

#[test]
fn prompt_layers_appear_in_order() {
    let builder = PromptBuilder::new().with_extra_instructions("Prefer terse answers.");
    let tools = vec![ToolDefinition {
        name: "messaging_send".to_string(),
        description: "Send a message to a peer agent".to_string(),
        parameters: json!({ "type": "object" }),
    }];

    let prompt = builder.build(&ctx(), "Joint research on caching", &tools);

    let base_pos = prompt.find("autonomous agent").unwrap();
    let extra_pos = prompt.find("Prefer terse answers").unwrap();
    let channel_pos = prompt.find("Joint research on caching").unwrap();
    let tools_pos = prompt.find("messaging_send").unwrap();
    let constraints_pos = prompt.find("Constraints:").unwrap();
    assert!(base_pos < extra_pos);
    assert!(extra_pos < channel_pos);
    assert!(channel_pos < tools_pos);
    assert!(tools_pos < constraints_pos);
}

#[test]
fn prompt_tokens_are_resolved_per_request() {
    let prompt = PromptBuilder::new().build(&ctx(), "", &[]);
    assert!(prompt.contains("agent-1"));
    assert!(prompt.contains("research"));
    assert!(prompt.contains("observation"));
    assert!(!prompt.contains("{{AGENT_ID}}"));
}

#[test]
fn only_callable_tools_are_documented() {
    let prompt = PromptBuilder::new().build(&ctx(), "", &[]);
    assert!(!prompt.contains("Available tools"));
}

#[test]
fn attribution_prefixes_peer_turns() {
    let message = ConversationMessage::user("status update").with_agent("agent-2");
    let attributed = attributed(&message);
    assert_eq!(attributed.content, "[agent-2]: status update");

    // Applying twice does not double the prefix.
    let again = super::attributed(&attributed);
    assert_eq!(again.content, "[agent-2]: status update");
}

#[test]
fn system_and_tool_messages_are_not_attributed() {
    let system = ConversationMessage::summary("earlier context");
    assert_eq!(attributed(&system).content, "earlier context");

    let tool = ConversationMessage::tool_result("tc1", "ok");
    assert_eq!(attributed(&tool).content, "ok");

    let anonymous = ConversationMessage::user("no agent id");
    assert_eq!(attributed(&anonymous).content, "no agent id");
}
