use crate::bus::{Envelope, EventBus, events};
use crate::errors::{MxfError, ValidationIssue};
use crate::providers::base::ToolDefinition;
use crate::tools::{ExecutionContext, Tool, ToolResult};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_RESULT_CHARS: usize = 10000;

/// Where a tool's implementation lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    External { server_id: String },
}

/// Visibility scope of a registered tool. Channel-scoped descriptors shadow
/// global ones of the same name inside their channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolScope {
    Global,
    Channel(String),
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    source: ToolSource,
    scope: ToolScope,
    /// Compiled input schema; `None` if the schema failed to compile
    /// (validation is then skipped with a warning at registration).
    validator: Option<jsonschema::Validator>,
}

/// Per-agent restriction set applied during resolution, after the channel's
/// own `allowed_tools`.
#[derive(Debug, Clone, Default)]
pub struct AgentToolProfile {
    pub allowed_tools: Option<HashSet<String>>,
}

impl AgentToolProfile {
    pub fn allowing<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self {
            allowed_tools: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    fn permits(&self, name: &str) -> bool {
        self.allowed_tools
            .as_ref()
            .is_none_or(|allowed| allowed.contains(name))
    }
}

/// Federated tool registry: built-in tools, global external servers, and
/// channel-scoped external servers, resolved per agent with `allowed_tools`
/// intersection.
pub struct ToolRegistry {
    tools: RwLock<Vec<RegisteredTool>>,
    /// Channel `allowed_tools` restriction, keyed by channel id.
    channel_allowed: RwLock<HashMap<String, HashSet<String>>>,
    bus: Arc<EventBus>,
    max_result_chars: usize,
}

impl ToolRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
            channel_allowed: RwLock::new(HashMap::new()),
            bus,
            max_result_chars: DEFAULT_MAX_RESULT_CHARS,
        }
    }

    pub async fn set_channel_allowed_tools(
        &self,
        channel_id: &str,
        allowed: Option<Vec<String>>,
    ) {
        let mut map = self.channel_allowed.write().await;
        match allowed {
            Some(names) => {
                map.insert(channel_id.to_string(), names.into_iter().collect());
            }
            None => {
                map.remove(channel_id);
            }
        }
    }

    /// Register a tool. Unique by `(name, scope)`: a duplicate replaces the
    /// existing descriptor with a warning.
    pub async fn register(&self, tool: Arc<dyn Tool>, source: ToolSource, scope: ToolScope) {
        let name = tool.name().to_string();
        if name.is_empty() || name.len() > 256 || name.chars().any(char::is_control) {
            warn!(
                "tool registry: rejecting tool with invalid name (len={})",
                name.len()
            );
            return;
        }

        let validator = match jsonschema::validator_for(&tool.parameters()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    "tool registry: schema for '{}' failed to compile ({}), skipping validation",
                    name, e
                );
                None
            }
        };

        let mut tools = self.tools.write().await;
        if let Some(existing) = tools
            .iter_mut()
            .find(|t| t.tool.name() == name && t.scope == scope)
        {
            warn!("tool registry: replacing duplicate tool '{}' in {:?}", name, scope);
            *existing = RegisteredTool {
                tool,
                source,
                scope,
                validator,
            };
            return;
        }
        tools.push(RegisteredTool {
            tool,
            source: source.clone(),
            scope,
            validator,
        });
        drop(tools);

        debug!("tool registry: registered '{}' ({:?})", name, source);
        self.bus
            .emit(
                Envelope::new(events::MCP_TOOL_REGISTERED, json!({ "tool": name }))
                    .with_agent("system"),
            )
            .await;
    }

    /// Remove every tool provided by one external server. Used when a server
    /// stops or pins `failed`.
    pub async fn unregister_external(&self, server_id: &str) -> usize {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|t| {
            !matches!(&t.source, ToolSource::External { server_id: sid } if sid == server_id)
        });
        let removed = before - tools.len();
        if removed > 0 {
            info!(
                "tool registry: unregistered {} tools from server '{}'",
                removed, server_id
            );
        }
        removed
    }

    async fn channel_permits(&self, channel_id: &str, name: &str) -> bool {
        self.channel_allowed
            .read()
            .await
            .get(channel_id)
            .is_none_or(|allowed| allowed.contains(name))
    }

    /// Resolve a tool name for an agent: channel-scoped descriptors first,
    /// then global; filter by channel `allowed_tools`, then by the agent's.
    /// The first surviving descriptor wins.
    pub async fn resolve(
        &self,
        name: &str,
        channel_id: &str,
        profile: &AgentToolProfile,
    ) -> Result<(Arc<dyn Tool>, ToolSource), MxfError> {
        let tools = self.tools.read().await;
        let mut candidates: Vec<&RegisteredTool> = tools
            .iter()
            .filter(|t| t.tool.name() == name)
            .filter(|t| match &t.scope {
                ToolScope::Global => true,
                ToolScope::Channel(ch) => ch == channel_id,
            })
            .collect();
        if candidates.is_empty() {
            return Err(MxfError::ToolNotFound {
                name: name.to_string(),
            });
        }
        // Channel scope shadows global.
        candidates.sort_by_key(|t| matches!(t.scope, ToolScope::Global));

        if !self.channel_permits(channel_id, name).await || !profile.permits(name) {
            return Err(MxfError::ToolForbidden {
                name: name.to_string(),
                agent_id: String::new(),
            });
        }

        let winner = candidates[0];
        Ok((winner.tool.clone(), winner.source.clone()))
    }

    /// Validate args against the winning descriptor's input schema.
    async fn validate_args(
        &self,
        name: &str,
        channel_id: &str,
        args: &Value,
    ) -> Result<(), MxfError> {
        let tools = self.tools.read().await;
        let mut candidates: Vec<&RegisteredTool> = tools
            .iter()
            .filter(|t| t.tool.name() == name)
            .filter(|t| match &t.scope {
                ToolScope::Global => true,
                ToolScope::Channel(ch) => ch == channel_id,
            })
            .collect();
        // Same shadowing rule as resolution: the channel-scoped descriptor's
        // schema is the one that validates.
        candidates.sort_by_key(|t| matches!(t.scope, ToolScope::Global));
        let Some(descriptor) = candidates.first() else {
            return Ok(());
        };
        let Some(validator) = &descriptor.validator else {
            return Ok(());
        };

        let issues: Vec<ValidationIssue> = validator
            .iter_errors(args)
            .map(|err| ValidationIssue::error(err.instance_path().to_string(), err.to_string()))
            .collect();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(MxfError::validation(
                format!("arguments for '{}' failed schema validation", name),
                issues,
            ))
        }
    }

    /// Tool definitions visible to one agent, for prompt documentation and
    /// the provider tool list. Channel-scoped tools shadow same-named
    /// globals; restrictions are applied.
    pub async fn definitions_for(
        &self,
        channel_id: &str,
        profile: &AgentToolProfile,
    ) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut by_name: HashMap<&str, &RegisteredTool> = HashMap::new();
        for registered in tools.iter() {
            let visible = match &registered.scope {
                ToolScope::Global => true,
                ToolScope::Channel(ch) => ch == channel_id,
            };
            if !visible {
                continue;
            }
            match by_name.entry(registered.tool.name()) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(registered);
                }
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    if matches!(registered.scope, ToolScope::Channel(_)) {
                        entry.insert(registered);
                    }
                }
            }
        }

        let channel_allowed = self.channel_allowed.read().await;
        let channel_filter = channel_allowed.get(channel_id);

        let mut defs: Vec<ToolDefinition> = by_name
            .into_values()
            .filter(|t| {
                let name = t.tool.name();
                channel_filter.is_none_or(|allowed| allowed.contains(name))
                    && profile.permits(name)
            })
            .map(|t| ToolDefinition {
                name: t.tool.name().to_string(),
                description: t.tool.description().to_string(),
                parameters: t.tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Names and categories of everything visible to an agent. Used by the
    /// discovery builtins.
    pub async fn catalog_for(
        &self,
        channel_id: &str,
        profile: &AgentToolProfile,
    ) -> Vec<(String, String, String)> {
        let tools = self.tools.read().await;
        let channel_allowed = self.channel_allowed.read().await;
        let channel_filter = channel_allowed.get(channel_id);

        let mut entries: Vec<(String, String, String)> = tools
            .iter()
            .filter(|t| match &t.scope {
                ToolScope::Global => true,
                ToolScope::Channel(ch) => ch == channel_id,
            })
            .filter(|t| {
                let name = t.tool.name();
                channel_filter.is_none_or(|allowed| allowed.contains(name))
                    && profile.permits(name)
            })
            .map(|t| {
                (
                    t.tool.name().to_string(),
                    t.tool.category().to_string(),
                    t.tool.description().to_string(),
                )
            })
            .collect();
        entries.sort();
        entries.dedup_by(|a, b| a.0 == b.0);
        entries
    }

    /// Full dispatch pipeline: resolve → validate → emit `mcp.tool_call` →
    /// execute with guards → truncate → emit `mcp.tool_result` /
    /// `mcp.tool_error`.
    ///
    /// Resolution and validation failures return `Err`; the caller decides
    /// how to surface them (the runtime appends synthetic tool results).
    /// Tool-level failures return `Ok` with `is_error = true`.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ExecutionContext,
        profile: &AgentToolProfile,
    ) -> Result<ToolResult, MxfError> {
        let (tool, source) = match self.resolve(name, &ctx.channel_id, profile).await {
            Ok(resolved) => resolved,
            Err(MxfError::ToolForbidden { name, .. }) => {
                return Err(MxfError::ToolForbidden {
                    name,
                    agent_id: ctx.agent_id.clone(),
                });
            }
            Err(e) => return Err(e),
        };

        self.validate_args(name, &ctx.channel_id, &args).await?;

        self.bus
            .emit(
                Envelope::new(
                    events::MCP_TOOL_CALL,
                    json!({ "tool": name, "arguments": args, "source": source_label(&source) }),
                )
                .with_channel(ctx.channel_id.clone())
                .with_agent(ctx.agent_id.clone())
                .with_request_id(ctx.request_id.clone()),
            )
            .await;

        let mut result = self.execute_with_guards(name, tool, args, ctx).await;
        if result.content.len() > self.max_result_chars {
            result.content = truncate_result(&result.content, self.max_result_chars);
        }

        let event_type = if result.is_error {
            events::MCP_TOOL_ERROR
        } else {
            events::MCP_TOOL_RESULT
        };
        self.bus
            .emit(
                Envelope::new(event_type, result.to_wire())
                    .with_channel(ctx.channel_id.clone())
                    .with_agent(ctx.agent_id.clone())
                    .with_request_id(ctx.request_id.clone()),
            )
            .await;

        Ok(result)
    }

    /// Execute in a spawned task with timeout and panic isolation. Panics and
    /// timeouts become error results, keeping the agent loop alive.
    async fn execute_with_guards(
        &self,
        name: &str,
        tool: Arc<dyn Tool>,
        args: Value,
        ctx: &ExecutionContext,
    ) -> ToolResult {
        let tool_name = name.to_string();
        let ctx = ctx.clone();
        let timeout = tool.execution_timeout();
        let timeout_secs = timeout.as_secs();

        let handle = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(args, &ctx)).await
        });

        match handle.await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                warn!("tool '{}' failed: {}", tool_name, e);
                ToolResult::error(format!("Tool '{}' failed: {}", tool_name, e))
            }
            Ok(Err(_)) => {
                warn!("tool '{}' timed out after {}s", tool_name, timeout_secs);
                ToolResult::error(format!(
                    "Tool '{}' timed out after {}s",
                    tool_name, timeout_secs
                ))
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    // Extract the panic message for the LLM so it can avoid
                    // repeating the call. into_panic() consumes the error.
                    let payload = join_err.into_panic();
                    let panic_msg = payload
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| payload.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown cause");
                    error!("tool '{}' panicked: {}", tool_name, panic_msg);
                    ToolResult::error(format!("Tool '{}' crashed: {}", tool_name, panic_msg))
                } else {
                    ToolResult::error(format!("Tool '{}' was cancelled", tool_name))
                }
            }
        }
    }
}

fn source_label(source: &ToolSource) -> String {
    match source {
        ToolSource::Builtin => "builtin".to_string(),
        ToolSource::External { server_id } => format!("external:{}", server_id),
    }
}

fn truncate_result(content: &str, max_chars: usize) -> String {
    let mut cut = max_chars;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[... truncated {} chars]",
        &content[..cut],
        content.len() - cut
    )
}
