use crate::params::ParamService;
use crate::tasks::{ActiveTaskMap, TaskService};
use crate::tools::{ExecutionContext, Tool, ToolResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

/// Terminal tool for the current task. Only the assignee (or the configured
/// completion agent) reaches `completed`; the service enforces that.
pub struct TaskCompleteTool {
    tasks: Arc<TaskService>,
    active: ActiveTaskMap,
    params: Arc<ParamService>,
}

impl TaskCompleteTool {
    pub fn new(tasks: Arc<TaskService>, active: ActiveTaskMap, params: Arc<ParamService>) -> Self {
        Self {
            tasks,
            active,
            params,
        }
    }
}

#[async_trait]
impl Tool for TaskCompleteTool {
    fn name(&self) -> &str {
        "task_complete"
    }
    fn description(&self) -> &str {
        "Mark your current task as finished, with a summary of the outcome"
    }
    fn category(&self) -> &str {
        "tasks"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" },
                "success": { "type": "boolean" },
                "details": { "type": "string" },
                "nextSteps": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["summary"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        let task_id = {
            let active = self.active.read().await;
            active.get(&ctx.agent_id).cloned()
        };
        let Some(task_id) = task_id else {
            return Ok(ToolResult::error(
                json!({ "success": false, "error": "no active task for this agent" }).to_string(),
            ));
        };

        let summary = args["summary"].as_str().unwrap_or_default();
        let success = args["success"].as_bool().unwrap_or(true);
        let task = match self
            .tasks
            .complete(&task_id, &ctx.agent_id, summary, success)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                return Ok(ToolResult::error(
                    json!({ "success": false, "error": e.to_string(), "code": e.code().as_str() })
                        .to_string(),
                ));
            }
        };

        self.active.write().await.remove(&ctx.agent_id);
        // Task-scoped parameter overrides end with the task.
        self.params.end_task(&ctx.agent_id);
        info!("agent {} completed task {}", ctx.agent_id, task_id);

        Ok(ToolResult::json(&json!({
            "success": true,
            "taskId": task.task_id,
            "status": task.status,
            "details": args.get("details").cloned().unwrap_or(Value::Null),
            "nextSteps": args.get("nextSteps").cloned().unwrap_or(json!([])),
        })))
    }
}

/// Explicit "nothing to do" terminal. The runtime ends the turn when it sees
/// this call succeed.
pub struct NoFurtherActionTool;

#[async_trait]
impl Tool for NoFurtherActionTool {
    fn name(&self) -> &str {
        "no_further_action"
    }
    fn description(&self) -> &str {
        "Declare that no action is warranted for the current input"
    }
    fn category(&self) -> &str {
        "tasks"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string" },
                "taskStatus": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::json(&json!({
            "acknowledged": true,
            "reason": args.get("reason").cloned().unwrap_or(Value::Null),
        })))
    }
}
