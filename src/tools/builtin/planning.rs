use crate::bus::{Envelope, EventBus, events};
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanItemStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    #[serde(rename = "itemId")]
    pub item_id: String,
    pub description: String,
    pub status: PlanItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "planId")]
    pub plan_id: String,
    pub title: String,
    pub items: Vec<PlanItem>,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    pub shared: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Channel-scoped plan store behind the four planning builtins. Shared plans
/// are announced on the bus as `controlloop.plan` events.
#[derive(Default)]
pub struct PlanBoard {
    plans: RwLock<HashMap<String, Vec<Plan>>>,
}

impl PlanBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn find(&self, channel_id: &str, plan_id: &str) -> Option<Plan> {
        let plans = self.plans.read().await;
        plans
            .get(channel_id)?
            .iter()
            .find(|p| p.plan_id == plan_id)
            .cloned()
    }
}

pub struct PlanningCreateTool {
    board: Arc<PlanBoard>,
}

impl PlanningCreateTool {
    pub fn new(board: Arc<PlanBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for PlanningCreateTool {
    fn name(&self) -> &str {
        "planning_create"
    }
    fn description(&self) -> &str {
        "Create a structured plan with ordered items"
    }
    fn category(&self) -> &str {
        "planning"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "minLength": 1 },
                "items": { "type": "array", "items": { "type": "string" }, "minItems": 1 }
            },
            "required": ["title", "items"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let items: Vec<PlanItem> = args["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|description| PlanItem {
                        item_id: Uuid::new_v4().simple().to_string(),
                        description: description.to_string(),
                        status: PlanItemStatus::Pending,
                        note: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let plan = Plan {
            plan_id: Uuid::new_v4().simple().to_string(),
            title: args["title"].as_str().unwrap_or_default().to_string(),
            items,
            created_by: ctx.agent_id.clone(),
            shared: false,
            created_at: Utc::now(),
        };

        let mut plans = self.board.plans.write().await;
        plans
            .entry(ctx.channel_id.clone())
            .or_default()
            .push(plan.clone());

        Ok(ToolResult::json(&json!({
            "planId": plan.plan_id,
            "itemIds": plan.items.iter().map(|i| i.item_id.clone()).collect::<Vec<_>>(),
        })))
    }
}

pub struct PlanningShareTool {
    board: Arc<PlanBoard>,
    bus: Arc<EventBus>,
}

impl PlanningShareTool {
    pub fn new(board: Arc<PlanBoard>, bus: Arc<EventBus>) -> Self {
        Self { board, bus }
    }
}

#[async_trait]
impl Tool for PlanningShareTool {
    fn name(&self) -> &str {
        "planning_share"
    }
    fn description(&self) -> &str {
        "Share a plan with the channel"
    }
    fn category(&self) -> &str {
        "planning"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "planId": { "type": "string" }
            },
            "required": ["planId"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let plan_id = args["planId"].as_str().unwrap_or_default();
        let shared_plan = {
            let mut plans = self.board.plans.write().await;
            let channel_plans = plans.entry(ctx.channel_id.clone()).or_default();
            let Some(plan) = channel_plans.iter_mut().find(|p| p.plan_id == plan_id) else {
                return Ok(ToolResult::error(format!("plan '{}' not found", plan_id)));
            };
            plan.shared = true;
            plan.clone()
        };

        self.bus
            .emit(
                Envelope::new(events::CONTROLLOOP_PLAN, json!(shared_plan))
                    .with_channel(ctx.channel_id.clone())
                    .with_agent(ctx.agent_id.clone())
                    .with_request_id(ctx.request_id.clone()),
            )
            .await;
        Ok(ToolResult::json(&json!({ "success": true, "planId": plan_id })))
    }
}

pub struct PlanningUpdateItemTool {
    board: Arc<PlanBoard>,
    bus: Arc<EventBus>,
}

impl PlanningUpdateItemTool {
    pub fn new(board: Arc<PlanBoard>, bus: Arc<EventBus>) -> Self {
        Self { board, bus }
    }
}

#[async_trait]
impl Tool for PlanningUpdateItemTool {
    fn name(&self) -> &str {
        "planning_update_item"
    }
    fn description(&self) -> &str {
        "Update the status of one plan item"
    }
    fn category(&self) -> &str {
        "planning"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "planId": { "type": "string" },
                "itemId": { "type": "string" },
                "status": { "type": "string", "enum": ["pending", "in_progress", "done", "blocked"] },
                "note": { "type": "string" }
            },
            "required": ["planId", "itemId", "status"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let plan_id = args["planId"].as_str().unwrap_or_default();
        let item_id = args["itemId"].as_str().unwrap_or_default();
        let status = match args["status"].as_str() {
            Some("pending") => PlanItemStatus::Pending,
            Some("in_progress") => PlanItemStatus::InProgress,
            Some("done") => PlanItemStatus::Done,
            Some("blocked") => PlanItemStatus::Blocked,
            other => return Ok(ToolResult::error(format!("unknown status {:?}", other))),
        };

        let updated = {
            let mut plans = self.board.plans.write().await;
            let Some(channel_plans) = plans.get_mut(&ctx.channel_id) else {
                return Ok(ToolResult::error(format!("plan '{}' not found", plan_id)));
            };
            let Some(plan) = channel_plans.iter_mut().find(|p| p.plan_id == plan_id) else {
                return Ok(ToolResult::error(format!("plan '{}' not found", plan_id)));
            };
            let Some(item) = plan.items.iter_mut().find(|i| i.item_id == item_id) else {
                return Ok(ToolResult::error(format!("item '{}' not found", item_id)));
            };
            item.status = status;
            if let Some(note) = args["note"].as_str() {
                item.note = Some(note.to_string());
            }
            plan.shared.then(|| plan.clone())
        };

        if let Some(plan) = updated {
            self.bus
                .emit(
                    Envelope::new(events::CONTROLLOOP_PLAN, json!(plan))
                        .with_channel(ctx.channel_id.clone())
                        .with_agent(ctx.agent_id.clone())
                        .with_request_id(ctx.request_id.clone()),
                )
                .await;
        }
        Ok(ToolResult::json(&json!({
            "success": true,
            "planId": plan_id,
            "itemId": item_id,
            "status": status,
        })))
    }
}

pub struct PlanningViewTool {
    board: Arc<PlanBoard>,
}

impl PlanningViewTool {
    pub fn new(board: Arc<PlanBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl Tool for PlanningViewTool {
    fn name(&self) -> &str {
        "planning_view"
    }
    fn description(&self) -> &str {
        "View one plan, or all plans in this channel"
    }
    fn category(&self) -> &str {
        "planning"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "planId": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        match args["planId"].as_str() {
            Some(plan_id) => match self.board.find(&ctx.channel_id, plan_id).await {
                Some(plan) => Ok(ToolResult::json(&json!(plan))),
                None => Ok(ToolResult::error(format!("plan '{}' not found", plan_id))),
            },
            None => {
                let plans = self.board.plans.read().await;
                let channel_plans = plans.get(&ctx.channel_id).cloned().unwrap_or_default();
                Ok(ToolResult::json(&json!({ "plans": channel_plans })))
            }
        }
    }
}
