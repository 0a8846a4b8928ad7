pub mod code_exec;
pub mod discovery;
pub mod memory_read;
pub mod messaging;
pub mod params_tools;
pub mod planning;
pub mod task;

pub use planning::PlanBoard;

use crate::bus::EventBus;
use crate::config::AgentConfig;
use crate::memory::MemoryService;
use crate::params::ParamService;
use crate::sandbox::Sandbox;
use crate::session::SessionManager;
use crate::tasks::{ActiveTaskMap, TaskService};
use crate::tools::registry::{ToolRegistry, ToolScope, ToolSource};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the built-in tool surface needs, threaded through construction
/// rather than process globals.
pub struct BuiltinDeps {
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionManager>,
    pub memory: Arc<MemoryService>,
    pub tasks: Arc<TaskService>,
    pub active_tasks: ActiveTaskMap,
    pub params: Arc<ParamService>,
    pub sandbox: Arc<Sandbox>,
    pub plan_board: Arc<PlanBoard>,
    pub agents: Arc<HashMap<String, AgentConfig>>,
}

/// Register the full built-in tool surface as global-scope tools.
pub async fn register_builtin_tools(registry: &Arc<ToolRegistry>, deps: &BuiltinDeps) {
    use memory_read::{MemoryReadTool, ReadKind, ReadScope};

    let tools: Vec<Arc<dyn crate::tools::Tool>> = vec![
        Arc::new(messaging::MessagingSendTool::new(deps.bus.clone())),
        Arc::new(messaging::MessagingDiscoverTool::new(
            deps.sessions.clone(),
            deps.agents.clone(),
        )),
        Arc::new(messaging::MessagingCoordinateTool::new(deps.bus.clone())),
        Arc::new(messaging::MessagingBroadcastTool::new(deps.bus.clone())),
        Arc::new(MemoryReadTool::new(
            deps.memory.clone(),
            deps.bus.clone(),
            ReadScope::Agent,
            ReadKind::Context,
        )),
        Arc::new(MemoryReadTool::new(
            deps.memory.clone(),
            deps.bus.clone(),
            ReadScope::Agent,
            ReadKind::Memory,
        )),
        Arc::new(MemoryReadTool::new(
            deps.memory.clone(),
            deps.bus.clone(),
            ReadScope::Channel,
            ReadKind::Context,
        )),
        Arc::new(MemoryReadTool::new(
            deps.memory.clone(),
            deps.bus.clone(),
            ReadScope::Channel,
            ReadKind::Memory,
        )),
        Arc::new(task::TaskCompleteTool::new(
            deps.tasks.clone(),
            deps.active_tasks.clone(),
            deps.params.clone(),
        )),
        Arc::new(task::NoFurtherActionTool),
        Arc::new(discovery::ToolsDiscoverTool::new(Arc::downgrade(registry))),
        Arc::new(discovery::ToolsValidateTool::new(Arc::downgrade(registry))),
        Arc::new(discovery::ToolsRecommendTool::new(Arc::downgrade(registry))),
        Arc::new(params_tools::RequestParamsTool::new(deps.params.clone())),
        Arc::new(params_tools::GetCurrentParamsTool::new(deps.params.clone())),
        Arc::new(params_tools::GetParameterStatusTool::new(deps.params.clone())),
        Arc::new(params_tools::GetAvailableModelsTool::new(deps.params.clone())),
        Arc::new(params_tools::GetCostAnalyticsTool::new(deps.params.clone())),
        Arc::new(params_tools::ResetParamsTool::new(deps.params.clone())),
        Arc::new(code_exec::CodeExecuteTool::new(deps.sandbox.clone())),
        Arc::new(planning::PlanningCreateTool::new(deps.plan_board.clone())),
        Arc::new(planning::PlanningShareTool::new(
            deps.plan_board.clone(),
            deps.bus.clone(),
        )),
        Arc::new(planning::PlanningUpdateItemTool::new(
            deps.plan_board.clone(),
            deps.bus.clone(),
        )),
        Arc::new(planning::PlanningViewTool::new(deps.plan_board.clone())),
    ];

    for tool in tools {
        registry
            .register(tool, ToolSource::Builtin, ToolScope::Global)
            .await;
    }
}

#[cfg(test)]
mod tests;
