use crate::sandbox::{ExecutionRequest, Language, Sandbox};
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// `code_execute` — run javascript/typescript in the container sandbox.
pub struct CodeExecuteTool {
    sandbox: Arc<Sandbox>,
}

impl CodeExecuteTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for CodeExecuteTool {
    fn name(&self) -> &str {
        "code_execute"
    }
    fn description(&self) -> &str {
        "Execute javascript or typescript in an isolated container; the return expression is the output"
    }
    fn category(&self) -> &str {
        "execution"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "minLength": 1 },
                "language": { "type": "string", "enum": ["javascript", "typescript"] },
                "timeout": { "type": "integer", "minimum": 1 },
                "context": { "type": "object" },
                "captureConsole": { "type": "boolean" }
            },
            "required": ["code"]
        })
    }

    /// Container startup plus the capped in-container timeout.
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(90)
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let language = match args["language"].as_str() {
            Some("typescript") => Language::Typescript,
            Some("javascript") | None => Language::Javascript,
            Some(other) => {
                return Ok(ToolResult::error(format!(
                    "unsupported language '{}'",
                    other
                )));
            }
        };

        let request = ExecutionRequest {
            code: args["code"].as_str().unwrap_or_default().to_string(),
            language,
            timeout_ms: args["timeout"].as_u64(),
            context: args.get("context").cloned(),
            capture_console: args["captureConsole"].as_bool().unwrap_or(false),
        };

        let outcome = self
            .sandbox
            .execute(&ctx.agent_id, &ctx.channel_id, request)
            .await;
        let is_error = !outcome.success;
        let payload = json!(outcome);
        if is_error {
            Ok(ToolResult::error(payload.to_string()))
        } else {
            Ok(ToolResult::json(&payload))
        }
    }
}
