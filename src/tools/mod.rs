pub mod builtin;
pub mod convert;
pub mod external;
pub mod registry;

pub use registry::{ToolRegistry, ToolScope, ToolSource};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Result of one tool execution. Errors are data: a failing tool yields
/// `is_error = true`, never an `Err`, so the agent loop always gets a
/// paired result to append.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Serialize a JSON payload as the result content.
    pub fn json(value: &Value) -> Self {
        Self::new(value.to_string())
    }

    /// Convert a `Result<String>` into a `ToolResult`, formatting errors with
    /// the given prefix.
    pub fn from_result(result: anyhow::Result<String>, error_prefix: &str) -> Self {
        match result {
            Ok(content) => Self::new(content),
            Err(e) => Self::error(format!("{} error: {}", error_prefix, e)),
        }
    }

    /// Unified wire shape: `{content:{type,data}}` on success, `{error}` on
    /// failure. This is what crosses the bus and what external observers see.
    pub fn to_wire(&self) -> Value {
        if self.is_error {
            serde_json::json!({ "error": &self.content })
        } else {
            serde_json::json!({ "content": { "type": "text", "data": &self.content } })
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

/// Context passed to every tool execution: the verified identity of the
/// calling agent plus correlation ids for event emission.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub agent_id: String,
    pub channel_id: String,
    /// The originating `toolCallId`; doubles as the `requestId` on emitted
    /// `mcp.*` events.
    pub request_id: String,
    pub correlation_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(
        agent_id: impl Into<String>,
        channel_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
            request_id: request_id.into(),
            correlation_id: None,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value; // JSON Schema

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult>;

    fn category(&self) -> &str {
        "general"
    }

    /// Per-tool execution timeout. Overrides the registry-level default.
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}
