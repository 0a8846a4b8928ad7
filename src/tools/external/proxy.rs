use crate::tools::external::{ActivityTracker, Connection};
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, RawContent};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Wraps one tool of an external MCP server as an `impl Tool`.
///
/// The connection slot is shared with the server's supervisor: a restart
/// swaps in a fresh connection without re-registering the proxy, and a
/// stopped server leaves `None`, which surfaces as an error result.
pub struct ExternalProxyTool {
    server_id: String,
    tool_name: String,
    /// Leaked so `description()` can return `&str` borrowed from self with
    /// no per-call allocation. Tools live for the process lifetime.
    tool_description: &'static str,
    input_schema: Value,
    connection: Arc<RwLock<Option<Connection>>>,
    activity: Arc<ActivityTracker>,
}

impl ExternalProxyTool {
    pub fn new(
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        description: String,
        input_schema: Value,
        connection: Arc<RwLock<Option<Connection>>>,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        let tool_description: &'static str = Box::leak(description.into_boxed_str());
        Self {
            server_id: server_id.into(),
            tool_name: tool_name.into(),
            tool_description,
            input_schema,
            connection,
            activity,
        }
    }
}

#[async_trait]
impl Tool for ExternalProxyTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        self.tool_description
    }

    fn parameters(&self) -> Value {
        self.input_schema.clone()
    }

    fn category(&self) -> &str {
        "external"
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        debug!("external tool call: {} via {}", self.tool_name, self.server_id);
        self.activity.touch(&self.server_id);

        let connection = self.connection.read().await.clone();
        let Some(connection) = connection else {
            return Ok(ToolResult::error(format!(
                "External server '{}' is not running",
                self.server_id
            )));
        };

        match connection {
            Connection::Stdio(peer) => {
                let arguments = match args {
                    Value::Object(map) => Some(map),
                    Value::Null => None,
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("input".to_string(), other);
                        Some(map)
                    }
                };
                let mut request = CallToolRequestParams::new(Cow::Owned(self.tool_name.clone()));
                request.arguments = arguments;
                let result = match peer.call_tool(request).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("external tool '{}' failed: {}", self.tool_name, e);
                        return Ok(ToolResult::error(format!(
                            "External tool '{}' call failed: {}",
                            self.tool_name, e
                        )));
                    }
                };

                let is_error = result.is_error.unwrap_or(false);
                let mut output = String::new();
                for content in &result.content {
                    match &content.raw {
                        RawContent::Text(text) => {
                            if !output.is_empty() {
                                output.push('\n');
                            }
                            output.push_str(&text.text);
                        }
                        RawContent::Image(img) => {
                            if !output.is_empty() {
                                output.push('\n');
                            }
                            let _ = write!(
                                output,
                                "[Image: {} ({} bytes)]",
                                img.mime_type,
                                img.data.len()
                            );
                        }
                        other => {
                            debug!(
                                "external tool '{}': skipping non-text content {:?}",
                                self.tool_name, other
                            );
                        }
                    }
                }
                if is_error {
                    Ok(ToolResult::error(output))
                } else {
                    Ok(ToolResult::new(output))
                }
            }
            Connection::Http(client) => match client.call_tool(&self.tool_name, args).await {
                Ok((output, is_error)) => {
                    if is_error {
                        Ok(ToolResult::error(output))
                    } else {
                        Ok(ToolResult::new(output))
                    }
                }
                Err(e) => {
                    warn!("external tool '{}' failed: {}", self.tool_name, e);
                    Ok(ToolResult::error(format!(
                        "External tool '{}' call failed: {}",
                        self.tool_name, e
                    )))
                }
            },
        }
    }
}
