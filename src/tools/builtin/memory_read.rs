use crate::bus::{Envelope, EventBus};
use crate::memory::{MemoryAccessor, MemoryScope, MemoryService};
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_READ_LIMIT: usize = 50;

/// Which scope a read tool addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScope {
    Agent,
    Channel,
}

/// Whether the tool reads the full context map or filtered memory entries.
/// Context reads return every requested key; memory reads support tag
/// filtering and a result limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Context,
    Memory,
}

/// Shared implementation behind `agent_context_read`, `agent_memory_read`,
/// `channel_context_read`, and `channel_memory_read`.
pub struct MemoryReadTool {
    memory: Arc<MemoryService>,
    bus: Arc<EventBus>,
    scope: ReadScope,
    kind: ReadKind,
}

impl MemoryReadTool {
    pub fn new(
        memory: Arc<MemoryService>,
        bus: Arc<EventBus>,
        scope: ReadScope,
        kind: ReadKind,
    ) -> Self {
        Self {
            memory,
            bus,
            scope,
            kind,
        }
    }

    fn memory_scope(&self, ctx: &ExecutionContext) -> MemoryScope {
        match self.scope {
            ReadScope::Agent => MemoryScope::Agent(ctx.agent_id.clone()),
            ReadScope::Channel => MemoryScope::Channel(ctx.channel_id.clone()),
        }
    }
}

#[async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        match (self.scope, self.kind) {
            (ReadScope::Agent, ReadKind::Context) => "agent_context_read",
            (ReadScope::Agent, ReadKind::Memory) => "agent_memory_read",
            (ReadScope::Channel, ReadKind::Context) => "channel_context_read",
            (ReadScope::Channel, ReadKind::Memory) => "channel_memory_read",
        }
    }

    fn description(&self) -> &str {
        match (self.scope, self.kind) {
            (ReadScope::Agent, ReadKind::Context) => "Read your private context entries",
            (ReadScope::Agent, ReadKind::Memory) => {
                "Search your private memory by key or tag"
            }
            (ReadScope::Channel, ReadKind::Context) => "Read this channel's shared context",
            (ReadScope::Channel, ReadKind::Memory) => {
                "Search this channel's shared memory by key or tag"
            }
        }
    }

    fn category(&self) -> &str {
        "memory"
    }

    fn parameters(&self) -> Value {
        match self.kind {
            ReadKind::Context => json!({
                "type": "object",
                "properties": {
                    "keys": { "type": "array", "items": { "type": "string" } }
                }
            }),
            ReadKind::Memory => json!({
                "type": "object",
                "properties": {
                    "keys": { "type": "array", "items": { "type": "string" } },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "limit": { "type": "integer", "minimum": 1, "maximum": 200 }
                }
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let accessor = MemoryAccessor::agent(&ctx.agent_id, &ctx.channel_id);
        let scope = self.memory_scope(ctx);

        let requested: Option<Vec<String>> = args["keys"].as_array().map(|keys| {
            keys.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        });
        let keys = match requested {
            Some(keys) => keys,
            None => match self.memory.list(&accessor, &scope) {
                Ok(keys) => keys,
                Err(e) => return Ok(ToolResult::error(e.to_string())),
            },
        };

        let tags: Vec<String> = args["tags"]
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let limit = args["limit"]
            .as_u64()
            .map_or(DEFAULT_READ_LIMIT, |l| l as usize);

        let mut entries = serde_json::Map::new();
        for key in keys {
            if entries.len() >= limit {
                break;
            }
            let entry = match self.memory.get(&accessor, &scope, &key) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => return Ok(ToolResult::error(e.to_string())),
            };
            if !tags.is_empty() {
                let entry_tags: Vec<String> = entry.metadata["tags"]
                    .as_array()
                    .map(|t| {
                        t.iter()
                            .filter_map(|v| v.as_str().map(ToString::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                if !tags.iter().any(|t| entry_tags.contains(t)) {
                    continue;
                }
            }
            entries.insert(key, entry.value);
        }

        let result = json!({ "entries": entries, "count": entries.len() });
        self.bus
            .emit(
                Envelope::new("memory.get_result", result.clone())
                    .with_channel(ctx.channel_id.clone())
                    .with_agent(ctx.agent_id.clone())
                    .with_request_id(ctx.request_id.clone()),
            )
            .await;
        Ok(ToolResult::json(&result))
    }
}
