pub mod compaction;

pub use compaction::Compactor;

use crate::errors::MxfError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Default similarity window for duplicate suppression: only the single most
/// recent non-tool message is considered.
pub const DEFAULT_DEDUP_WINDOW: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation issued inside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(tool_call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(rename = "toolCallId", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "isToolResult", default)]
    pub is_tool_result: bool,
    /// Marks a compaction summary block.
    #[serde(rename = "contextSummary", default)]
    pub context_summary: bool,
    /// Originating agent, used for `[agentId]:` attribution in prompts.
    #[serde(rename = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_tool_result: false,
            context_summary: false,
            agent_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::base(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::base(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.is_tool_result = true;
        msg
    }

    /// Compaction summary block: logically `system`, flagged so later
    /// compactions can fold it into the next summary.
    pub fn summary(content: impl Into<String>) -> Self {
        let mut msg = Self::base(Role::System, content);
        msg.context_summary = true;
        msg
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Content form used for duplicate comparison: trimmed, internal
    /// whitespace collapsed, lowercased.
    pub fn normalized_content(&self) -> String {
        self.content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

/// What happened to a message handed to [`ConversationHistory::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    DroppedDuplicate,
}

/// How the pairing enforcer reacts to unanswered tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPolicy {
    /// Synthesize `{success:false, error:"no_result"}` tool messages for
    /// every missing id, then proceed.
    Synthesize,
    /// Abort the turn with `TOOL_PAIRING_VIOLATION`.
    Abort,
}

impl Default for PairingPolicy {
    fn default() -> Self {
        Self::Synthesize
    }
}

/// Ordered per-agent conversation with the dedup and pairing invariants.
///
/// Tool results are appended unconditionally: a tool message is never treated
/// as a duplicate, even when its content is byte-identical to its neighbor.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: Vec<ConversationMessage>,
    dedup_window: usize,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::with_dedup_window(DEFAULT_DEDUP_WINDOW)
    }

    pub fn with_dedup_window(dedup_window: usize) -> Self {
        Self {
            messages: Vec::new(),
            dedup_window,
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append with duplicate suppression.
    ///
    /// Tool messages and tool results bypass the check entirely. Everything
    /// else is compared (role + normalized content) against the last
    /// `dedup_window` non-tool messages.
    pub fn append(&mut self, message: ConversationMessage) -> AppendOutcome {
        if message.role == Role::Tool || message.is_tool_result {
            self.messages.push(message);
            return AppendOutcome::Appended;
        }

        let normalized = message.normalized_content();
        let mut inspected = 0;
        for prior in self.messages.iter().rev() {
            if prior.role == Role::Tool || prior.is_tool_result {
                continue;
            }
            if inspected >= self.dedup_window {
                break;
            }
            inspected += 1;
            if prior.role == message.role && prior.normalized_content() == normalized {
                debug!("conversation: dropping duplicate {:?} message", message.role);
                return AppendOutcome::DroppedDuplicate;
            }
        }

        self.messages.push(message);
        AppendOutcome::Appended
    }

    /// Tool-call ids issued by assistant messages that have no matching tool
    /// message yet, in issue order.
    pub fn unanswered_tool_calls(&self) -> Vec<ToolCall> {
        let mut issued: Vec<&ToolCall> = Vec::new();
        for message in &self.messages {
            if message.role == Role::Assistant {
                issued.extend(message.tool_calls.iter());
            }
        }
        issued
            .into_iter()
            .filter(|call| {
                !self.messages.iter().any(|m| {
                    m.role == Role::Tool
                        && m.tool_call_id.as_deref() == Some(call.tool_call_id.as_str())
                })
            })
            .cloned()
            .collect()
    }

    /// Enforce the pairing invariant before the next inference.
    ///
    /// With [`PairingPolicy::Synthesize`], failure tool messages referencing
    /// each missing id are appended and their ids returned. With
    /// [`PairingPolicy::Abort`], any unanswered call aborts the turn.
    pub fn enforce_pairing(&mut self, policy: PairingPolicy) -> Result<Vec<String>, MxfError> {
        let missing = self.unanswered_tool_calls();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        match policy {
            PairingPolicy::Abort => {
                let ids: Vec<String> = missing.into_iter().map(|c| c.tool_call_id).collect();
                Err(MxfError::PairingViolation(format!(
                    "unanswered tool calls: {}",
                    ids.join(", ")
                )))
            }
            PairingPolicy::Synthesize => {
                let mut synthesized = Vec::with_capacity(missing.len());
                for call in missing {
                    warn!(
                        "conversation: synthesizing no_result for unanswered tool call {} ({})",
                        call.tool_call_id, call.name
                    );
                    let body = serde_json::json!({ "success": false, "error": "no_result" });
                    self.messages.push(ConversationMessage::tool_result(
                        call.tool_call_id.clone(),
                        body.to_string(),
                    ));
                    synthesized.push(call.tool_call_id);
                }
                Ok(synthesized)
            }
        }
    }

    /// Replace the whole message sequence. Used by compaction, which computes
    /// the replacement outside the history.
    pub(crate) fn replace_messages(&mut self, messages: Vec<ConversationMessage>) {
        self.messages = messages;
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
