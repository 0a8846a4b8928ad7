use crate::params::{OverrideScope, ParamPatch, ParamService, Phase, ResetScope};
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

fn parse_phase(value: &Value) -> Option<Phase> {
    value.as_str().and_then(|s| match s {
        "observation" => Some(Phase::Observation),
        "reasoning" => Some(Phase::Reasoning),
        "planning" => Some(Phase::Planning),
        "action" => Some(Phase::Action),
        "reflection" => Some(Phase::Reflection),
        _ => None,
    })
}

/// `request_inference_params` — agent-initiated override with governance.
pub struct RequestParamsTool {
    params: Arc<ParamService>,
}

impl RequestParamsTool {
    pub fn new(params: Arc<ParamService>) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Tool for RequestParamsTool {
    fn name(&self) -> &str {
        "request_inference_params"
    }
    fn description(&self) -> &str {
        "Request different inference parameters, with a reason and a lifetime scope"
    }
    fn category(&self) -> &str {
        "params"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "minLength": 1 },
                "suggested": {
                    "type": "object",
                    "properties": {
                        "model": { "type": "string" },
                        "temperature": { "type": "number" },
                        "reasoningTokens": { "type": "integer" },
                        "maxOutputTokens": { "type": "integer" }
                    }
                },
                "scope": {
                    "type": "string",
                    "enum": ["next_call", "current_phase", "task", "session"]
                },
                "phase": {
                    "type": "string",
                    "enum": ["observation", "reasoning", "planning", "action", "reflection"]
                }
            },
            "required": ["reason"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let reason = args["reason"].as_str().unwrap_or_default();
        let scope = match args["scope"].as_str() {
            Some("next_call") => OverrideScope::NextCall,
            Some("current_phase") => OverrideScope::CurrentPhase,
            Some("task") => OverrideScope::Task,
            Some("session") | None => OverrideScope::Session,
            Some(other) => {
                return Ok(ToolResult::error(format!("unknown scope '{}'", other)));
            }
        };
        let suggested = ParamPatch {
            model: args["suggested"]["model"].as_str().map(ToString::to_string),
            temperature: args["suggested"]["temperature"].as_f64().map(|t| t as f32),
            reasoning_tokens: args["suggested"]["reasoningTokens"].as_u64().map(|t| t as u32),
            max_output_tokens: args["suggested"]["maxOutputTokens"].as_u64().map(|t| t as u32),
        };

        match self.params.request_override(
            &ctx.agent_id,
            &ctx.channel_id,
            reason,
            suggested,
            scope,
            parse_phase(&args["phase"]),
        ) {
            Ok(response) => Ok(ToolResult::json(&json!(response))),
            Err(e) => Ok(ToolResult::error(
                json!({ "status": "denied", "error": e.to_string(), "code": e.code().as_str() })
                    .to_string(),
            )),
        }
    }
}

/// `get_current_params` — effective parameters per phase.
pub struct GetCurrentParamsTool {
    params: Arc<ParamService>,
}

impl GetCurrentParamsTool {
    pub fn new(params: Arc<ParamService>) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Tool for GetCurrentParamsTool {
    fn name(&self) -> &str {
        "get_current_params"
    }
    fn description(&self) -> &str {
        "Show the inference parameters currently in effect"
    }
    fn category(&self) -> &str {
        "params"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "phase": {
                    "type": "string",
                    "enum": ["observation", "reasoning", "planning", "action", "reflection"]
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let phases: Vec<Phase> = match parse_phase(&args["phase"]) {
            Some(phase) => vec![phase],
            None => Phase::ALL.to_vec(),
        };
        let mut resolved = serde_json::Map::new();
        for phase in phases {
            let params = self.params.resolve(&ctx.agent_id, &ctx.channel_id, phase);
            resolved.insert(phase.as_str().to_string(), json!(params));
        }
        Ok(ToolResult::json(&Value::Object(resolved)))
    }
}

/// `get_parameter_status` — active overrides and their scopes.
pub struct GetParameterStatusTool {
    params: Arc<ParamService>,
}

impl GetParameterStatusTool {
    pub fn new(params: Arc<ParamService>) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Tool for GetParameterStatusTool {
    fn name(&self) -> &str {
        "get_parameter_status"
    }
    fn description(&self) -> &str {
        "List your active parameter overrides"
    }
    fn category(&self) -> &str {
        "params"
    }
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let overrides: Vec<Value> = self
            .params
            .active_overrides(&ctx.agent_id)
            .into_iter()
            .map(|o| {
                json!({
                    "id": o.id,
                    "scope": o.scope,
                    "phase": o.phase.map(Phase::as_str),
                    "params": o.patch,
                    "reason": o.reason,
                    "createdAt": o.created_at,
                    "expiresAt": o.expires_at,
                })
            })
            .collect();
        Ok(ToolResult::json(&json!({
            "overrides": overrides,
            "count": overrides.len(),
        })))
    }
}

/// `get_available_models` — models agents may request.
pub struct GetAvailableModelsTool {
    params: Arc<ParamService>,
}

impl GetAvailableModelsTool {
    pub fn new(params: Arc<ParamService>) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Tool for GetAvailableModelsTool {
    fn name(&self) -> &str {
        "get_available_models"
    }
    fn description(&self) -> &str {
        "List the models available for parameter overrides"
    }
    fn category(&self) -> &str {
        "params"
    }
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::json(&json!({
            "models": self.params.known_models(),
        })))
    }
}

/// `get_parameter_cost_analytics` — usage aggregates and tips.
pub struct GetCostAnalyticsTool {
    params: Arc<ParamService>,
}

impl GetCostAnalyticsTool {
    pub fn new(params: Arc<ParamService>) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Tool for GetCostAnalyticsTool {
    fn name(&self) -> &str {
        "get_parameter_cost_analytics"
    }
    fn description(&self) -> &str {
        "Aggregate token usage per phase, model, and hour over a time range"
    }
    fn category(&self) -> &str {
        "params"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "timeRangeHours": { "type": "integer", "minimum": 1, "maximum": 720 }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let hours = args["timeRangeHours"].as_i64().unwrap_or(24);
        Ok(ToolResult::json(&self.params.cost_analytics(hours)))
    }
}

/// `reset_inference_params` — remove overrides by scope.
pub struct ResetParamsTool {
    params: Arc<ParamService>,
}

impl ResetParamsTool {
    pub fn new(params: Arc<ParamService>) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Tool for ResetParamsTool {
    fn name(&self) -> &str {
        "reset_inference_params"
    }
    fn description(&self) -> &str {
        "Remove your parameter overrides in the given scope"
    }
    fn category(&self) -> &str {
        "params"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "scope": {
                    "type": "string",
                    "enum": ["all", "session", "task", "current_phase", "next_call"]
                }
            },
            "required": ["scope"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let scope = match args["scope"].as_str() {
            Some("all") => ResetScope::All,
            Some("session") => ResetScope::Session,
            Some("task") => ResetScope::Task,
            Some("current_phase") => ResetScope::CurrentPhase,
            Some("next_call") => ResetScope::NextCall,
            other => {
                return Ok(ToolResult::error(format!(
                    "unknown reset scope {:?}",
                    other
                )));
            }
        };
        let count = self.params.reset(&ctx.agent_id, scope);
        Ok(ToolResult::json(&json!({
            "success": true,
            "scope": scope,
            "resetCount": count,
        })))
    }
}
