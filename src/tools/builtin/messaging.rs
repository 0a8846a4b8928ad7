use crate::bus::{Envelope, EventBus, events};
use crate::config::AgentConfig;
use crate::session::SessionManager;
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Send a direct message to one peer agent in the channel.
pub struct MessagingSendTool {
    bus: Arc<EventBus>,
}

impl MessagingSendTool {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessagingSendTool {
    fn name(&self) -> &str {
        "messaging_send"
    }
    fn description(&self) -> &str {
        "Send a direct message to another agent in this channel"
    }
    fn category(&self) -> &str {
        "messaging"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "targetAgentId": { "type": "string" },
                "message": { "type": "string" },
                "messageType": { "type": "string" },
                "priority": { "type": "string", "enum": ["low", "normal", "high", "urgent"] },
                "metadata": { "type": "object" }
            },
            "required": ["targetAgentId", "message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let target = args["targetAgentId"].as_str().unwrap_or_default();
        let report = self
            .bus
            .emit(
                Envelope::new(
                    events::MESSAGE_RECEIVED,
                    json!({
                        "from": &ctx.agent_id,
                        "to": target,
                        "message": args["message"],
                        "messageType": args.get("messageType").cloned().unwrap_or(Value::Null),
                        "priority": args.get("priority").cloned().unwrap_or(json!("normal")),
                        "metadata": args.get("metadata").cloned().unwrap_or(json!({})),
                    }),
                )
                .with_channel(ctx.channel_id.clone())
                .with_agent(ctx.agent_id.clone())
                .with_request_id(ctx.request_id.clone()),
            )
            .await;

        if report.delivered == 0 && !report.failed.is_empty() {
            return Ok(ToolResult::error(json!({
                "success": false,
                "error": "MESSAGE_SEND_FAILED",
            })
            .to_string()));
        }
        Ok(ToolResult::json(&json!({
            "success": true,
            "to": target,
            "delivered": report.delivered,
        })))
    }
}

/// Discover peer agents and their capability tags.
pub struct MessagingDiscoverTool {
    sessions: Arc<SessionManager>,
    agents: Arc<HashMap<String, AgentConfig>>,
}

impl MessagingDiscoverTool {
    pub fn new(sessions: Arc<SessionManager>, agents: Arc<HashMap<String, AgentConfig>>) -> Self {
        Self { sessions, agents }
    }
}

#[async_trait]
impl Tool for MessagingDiscoverTool {
    fn name(&self) -> &str {
        "messaging_discover"
    }
    fn description(&self) -> &str {
        "List active agents in this channel, optionally filtered by capability"
    }
    fn category(&self) -> &str {
        "messaging"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "capabilities": { "type": "array", "items": { "type": "string" } }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let wanted: Vec<String> = args["capabilities"]
            .as_array()
            .map(|caps| {
                caps.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let roster = self.sessions.channel_roster(&ctx.channel_id).await;
        let agents: Vec<Value> = roster
            .iter()
            .filter(|id| *id != &ctx.agent_id)
            .filter_map(|id| {
                let capabilities = self
                    .agents
                    .get(id)
                    .map(|a| a.capabilities.clone())
                    .unwrap_or_default();
                if !wanted.is_empty() && !wanted.iter().all(|w| capabilities.contains(w)) {
                    return None;
                }
                Some(json!({ "agentId": id, "capabilities": capabilities }))
            })
            .collect();

        Ok(ToolResult::json(&json!({ "agents": agents })))
    }
}

/// Send one message to a named set of recipients.
pub struct MessagingCoordinateTool {
    bus: Arc<EventBus>,
}

impl MessagingCoordinateTool {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessagingCoordinateTool {
    fn name(&self) -> &str {
        "messaging_coordinate"
    }
    fn description(&self) -> &str {
        "Send a coordination message to several agents at once"
    }
    fn category(&self) -> &str {
        "messaging"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "recipientIds": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "message": { "type": "string" },
                "metadata": { "type": "object" }
            },
            "required": ["recipientIds", "message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let recipients: Vec<&str> = args["recipientIds"]
            .as_array()
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for recipient in &recipients {
            let report = self
                .bus
                .emit(
                    Envelope::new(
                        events::MESSAGE_RECEIVED,
                        json!({
                            "from": &ctx.agent_id,
                            "to": recipient,
                            "message": args["message"],
                            "coordination": true,
                            "metadata": args.get("metadata").cloned().unwrap_or(json!({})),
                        }),
                    )
                    .with_channel(ctx.channel_id.clone())
                    .with_agent(ctx.agent_id.clone())
                    .with_request_id(ctx.request_id.clone()),
                )
                .await;
            delivered += report.delivered;
        }

        Ok(ToolResult::json(&json!({
            "success": true,
            "recipients": recipients.len(),
            "delivered": delivered,
        })))
    }
}

/// Broadcast to every subscriber of the channel.
pub struct MessagingBroadcastTool {
    bus: Arc<EventBus>,
}

impl MessagingBroadcastTool {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessagingBroadcastTool {
    fn name(&self) -> &str {
        "messaging_broadcast"
    }
    fn description(&self) -> &str {
        "Broadcast a message to every agent in this channel"
    }
    fn category(&self) -> &str {
        "messaging"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" },
                "metadata": { "type": "object" }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let report = self
            .bus
            .emit(
                Envelope::new(
                    events::MESSAGE_BROADCAST,
                    json!({
                        "from": &ctx.agent_id,
                        "message": args["message"],
                        "metadata": args.get("metadata").cloned().unwrap_or(json!({})),
                    }),
                )
                .with_channel(ctx.channel_id.clone())
                .with_agent(ctx.agent_id.clone())
                .with_request_id(ctx.request_id.clone()),
            )
            .await;

        Ok(ToolResult::json(&json!({
            "success": true,
            "delivered": report.delivered,
        })))
    }
}
