pub mod template;

pub use template::{TemplateContext, replace_tokens};

use crate::conversation::{ConversationMessage, Role};
use crate::providers::base::ToolDefinition;
use std::fmt::Write as _;

const BASE_INSTRUCTIONS: &str = "You are {{AGENT_ID}}, an autonomous agent in channel \
{{CHANNEL_NAME}} ({{CHANNEL_ID}}). The current date/time is {{DATE_TIME}} ({{DAY_OF_WEEK}}, \
timezone {{TIME_ZONE}}). You are one of {{ACTIVE_AGENTS_COUNT}} active agents: \
{{ACTIVE_AGENTS_LIST}}.

You operate autonomously: never ask a human for approval, never wait for input that is not an \
event. Complete assigned tasks by calling the task_complete tool; if no action is warranted, call \
no_further_action. Your inference backend is {{LLM_PROVIDER}}/{{LLM_MODEL}} (system LLM \
{{SYSTEM_LLM_STATUS}}); the current cognitive phase is {{CURRENT_ORPAR_PHASE}}.";

const CONSTRAINTS: &str = "Constraints:\n\
- Use tools only through tool calls; do not describe tool use in prose.\n\
- Every tool call result will be returned to you before your next turn.\n\
- Repeating an identical tool call is circuit-broken after a few attempts.\n\
- Keep peer messages concise and on-topic for the channel.";

/// Assembles the layered system prompt: base instructions, identity and
/// roster, callable-tool documentation, channel context, constraints.
/// Template tokens are replaced on every request, never at cache time.
pub struct PromptBuilder {
    /// Additional deployment-specific instructions appended after the base.
    pub extra_instructions: Option<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            extra_instructions: None,
        }
    }

    pub fn with_extra_instructions(mut self, extra: impl Into<String>) -> Self {
        self.extra_instructions = Some(extra.into());
        self
    }

    /// Build the full system prompt. `tools` must already be filtered to
    /// what the agent can actually call (the registry's resolution rules),
    /// so the documentation never advertises unreachable tools.
    pub fn build(
        &self,
        ctx: &TemplateContext,
        channel_description: &str,
        tools: &[ToolDefinition],
    ) -> String {
        let mut sections = Vec::new();
        sections.push(BASE_INSTRUCTIONS.to_string());
        if let Some(extra) = &self.extra_instructions {
            sections.push(extra.clone());
        }
        if !channel_description.is_empty() {
            sections.push(format!("Channel context: {}", channel_description));
        }
        if !tools.is_empty() {
            let mut docs = String::from("Available tools:\n");
            for tool in tools {
                let _ = writeln!(docs, "- {}: {}", tool.name, tool.description);
            }
            sections.push(docs.trim_end().to_string());
        }
        sections.push(CONSTRAINTS.to_string());

        replace_tokens(&sections.join("\n\n"), ctx)
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Attribution form for conversation replay: each historical message is its
/// own role-based turn with an `[agentId]:` prefix, never a concatenated
/// blob. System messages (including summaries) pass through untouched.
pub fn attributed(message: &ConversationMessage) -> ConversationMessage {
    if message.role == Role::System || message.role == Role::Tool {
        return message.clone();
    }
    let Some(agent_id) = &message.agent_id else {
        return message.clone();
    };
    let prefix = format!("[{}]: ", agent_id);
    if message.content.starts_with(&prefix) {
        return message.clone();
    }
    let mut attributed = message.clone();
    attributed.content = format!("{}{}", prefix, message.content);
    attributed
}

#[cfg(test)]
mod tests;
