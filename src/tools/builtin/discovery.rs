use crate::tools::registry::{AgentToolProfile, ToolRegistry};
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Weak;

const DEFAULT_DISCOVER_LIMIT: usize = 50;
const DEFAULT_RECOMMEND_LIMIT: usize = 5;

fn registry_gone() -> ToolResult {
    ToolResult::error("tool registry is shutting down")
}

/// Enumerate the tools this agent can actually call.
pub struct ToolsDiscoverTool {
    registry: Weak<ToolRegistry>,
}

impl ToolsDiscoverTool {
    pub fn new(registry: Weak<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ToolsDiscoverTool {
    fn name(&self) -> &str {
        "tools_discover"
    }
    fn description(&self) -> &str {
        "List callable tools, filtered by category, source, or name pattern"
    }
    fn category(&self) -> &str {
        "discovery"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": { "type": "string" },
                "source": { "type": "string", "enum": ["builtin", "external"] },
                "namePattern": { "type": "string" },
                "includeSchema": { "type": "boolean" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 200 }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(registry_gone());
        };
        let profile = AgentToolProfile::default();
        let catalog = registry.catalog_for(&ctx.channel_id, &profile).await;
        let definitions = registry.definitions_for(&ctx.channel_id, &profile).await;

        let category = args["category"].as_str();
        let name_pattern = args["namePattern"].as_str();
        let include_schema = args["includeSchema"].as_bool().unwrap_or(false);
        let limit = args["limit"]
            .as_u64()
            .map_or(DEFAULT_DISCOVER_LIMIT, |l| l as usize);

        let tools: Vec<Value> = catalog
            .iter()
            .filter(|(name, cat, _)| {
                category.is_none_or(|c| c == cat)
                    && name_pattern.is_none_or(|p| name.contains(p))
            })
            .take(limit)
            .map(|(name, cat, description)| {
                let mut entry = json!({
                    "name": name,
                    "category": cat,
                    "description": description,
                });
                if include_schema {
                    if let Some(def) = definitions.iter().find(|d| d.name == *name) {
                        entry["inputSchema"] = def.parameters.clone();
                    }
                }
                entry
            })
            .collect();

        Ok(ToolResult::json(&json!({ "tools": tools, "count": tools.len() })))
    }
}

/// Check that named tools resolve for this agent.
pub struct ToolsValidateTool {
    registry: Weak<ToolRegistry>,
}

impl ToolsValidateTool {
    pub fn new(registry: Weak<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ToolsValidateTool {
    fn name(&self) -> &str {
        "tools_validate"
    }
    fn description(&self) -> &str {
        "Check whether the named tools are callable for you right now"
    }
    fn category(&self) -> &str {
        "discovery"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "toolNames": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "checkConfiguration": { "type": "boolean" }
            },
            "required": ["toolNames"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(registry_gone());
        };
        let names: Vec<&str> = args["toolNames"]
            .as_array()
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let resolution = registry
                .resolve(name, &ctx.channel_id, &AgentToolProfile::default())
                .await;
            results.push(match resolution {
                Ok(_) => json!({ "name": name, "valid": true }),
                Err(e) => json!({
                    "name": name,
                    "valid": false,
                    "error": e.code().as_str(),
                }),
            });
        }

        Ok(ToolResult::json(&json!({ "results": results })))
    }
}

/// Rank callable tools against a stated intent. Scoring is lexical overlap
/// between intent words and each tool's name and description.
pub struct ToolsRecommendTool {
    registry: Weak<ToolRegistry>,
}

impl ToolsRecommendTool {
    pub fn new(registry: Weak<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ToolsRecommendTool {
    fn name(&self) -> &str {
        "tools_recommend"
    }
    fn description(&self) -> &str {
        "Recommend the most relevant tools for a stated intent"
    }
    fn category(&self) -> &str {
        "discovery"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "intent": { "type": "string", "minLength": 1 },
                "context": { "type": "string" },
                "maxRecommendations": { "type": "integer", "minimum": 1, "maximum": 20 },
                "categoryFilter": { "type": "string" },
                "excludeTools": { "type": "array", "items": { "type": "string" } },
                "includeValidationInsights": { "type": "boolean" },
                "includeParameterExamples": { "type": "boolean" },
                "includePatternRecommendations": { "type": "boolean" },
                "errorContext": { "type": "string" }
            },
            "required": ["intent"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(registry_gone());
        };
        let intent = args["intent"].as_str().unwrap_or_default().to_lowercase();
        let context = args["context"].as_str().unwrap_or_default().to_lowercase();
        let category_filter = args["categoryFilter"].as_str();
        let excluded: HashSet<&str> = args["excludeTools"]
            .as_array()
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let limit = args["maxRecommendations"]
            .as_u64()
            .map_or(DEFAULT_RECOMMEND_LIMIT, |l| l as usize);

        let words: HashSet<&str> = intent
            .split_whitespace()
            .chain(context.split_whitespace())
            .filter(|w| w.len() > 2)
            .collect();

        let catalog = registry
            .catalog_for(&ctx.channel_id, &AgentToolProfile::default())
            .await;
        let mut scored: Vec<(usize, Value)> = catalog
            .iter()
            .filter(|(name, cat, _)| {
                !excluded.contains(name.as_str()) && category_filter.is_none_or(|c| c == cat)
            })
            .filter_map(|(name, cat, description)| {
                let haystack = format!("{} {}", name.replace('_', " "), description.to_lowercase());
                let score = words.iter().filter(|w| haystack.contains(**w)).count();
                if score == 0 {
                    return None;
                }
                Some((
                    score,
                    json!({
                        "name": name,
                        "category": cat,
                        "description": description,
                        "score": score,
                    }),
                ))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let recommendations: Vec<Value> =
            scored.into_iter().take(limit).map(|(_, v)| v).collect();
        Ok(ToolResult::json(&json!({
            "intent": args["intent"],
            "recommendations": recommendations,
        })))
    }
}
