//! Shared test harness: a scripted LLM provider and a fully wired world of
//! MXF services backed by in-memory storage.
#![allow(dead_code)]

use async_trait::async_trait;
use mxf::bus::EventBus;
use mxf::config::{AgentConfig, ChannelConfig, ParamsConfig, RuntimeConfig, SandboxConfig};
use mxf::conversation::ToolCall;
use mxf::memory::{MemoryService, SqliteStore};
use mxf::params::ParamService;
use mxf::providers::base::{
    InferenceParams, InferenceRequest, InferenceResponse, LlmProvider, TokenUsage,
};
use mxf::runtime::{AgentRuntime, RuntimeDeps};
use mxf::sandbox::Sandbox;
use mxf::session::SessionManager;
use mxf::tasks::{ActiveTaskMap, TaskService};
use mxf::tools::builtin::{BuiltinDeps, PlanBoard, register_builtin_tools};
use mxf::tools::registry::ToolRegistry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Replays a per-agent script of responses; unscripted calls get a plain
/// "ok" text response. Scripts are keyed by the `[agentId]` attribution of
/// the latest user message, so one provider serves many runtimes.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<InferenceResponse>>>,
    pub seen_params: Mutex<Vec<InferenceParams>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            seen_params: Mutex::new(Vec::new()),
        })
    }

    pub fn script_for(&self, agent_id: &str, responses: Vec<InferenceResponse>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), responses.into());
    }

    pub fn text(content: &str) -> InferenceResponse {
        InferenceResponse {
            content: Some(content.to_string()),
            tool_calls: vec![],
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            finish_reason: Some("stop".to_string()),
        }
    }

    pub fn with_calls(calls: Vec<ToolCall>) -> InferenceResponse {
        InferenceResponse {
            content: None,
            tool_calls: calls,
            usage: TokenUsage::default(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn infer(&self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        self.seen_params
            .lock()
            .unwrap()
            .push(request.params.clone());

        // The system prompt names the agent: "You are <id>, ...".
        let owner = request
            .messages
            .first()
            .and_then(|m| m.content.strip_prefix("You are "))
            .and_then(|rest| rest.split(',').next())
            .unwrap_or_default()
            .to_string();

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&owner)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| Self::text("ok")))
    }

    fn default_model(&self) -> &str {
        "model-a"
    }
}

pub struct World {
    pub bus: Arc<EventBus>,
    pub registry: Arc<ToolRegistry>,
    pub provider: Arc<ScriptedProvider>,
    pub deps: RuntimeDeps,
}

pub async fn build_world() -> World {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let provider = ScriptedProvider::new();
    let registry = Arc::new(ToolRegistry::new(bus.clone()));
    let sessions = Arc::new(SessionManager::new(bus.clone()));
    let memory = Arc::new(MemoryService::new(store.clone()));
    let tasks = Arc::new(TaskService::new(store.clone(), bus.clone()));
    let params = Arc::new(ParamService::new(ParamsConfig::default(), "model-a"));
    let active_tasks = ActiveTaskMap::default();

    let builtin_deps = BuiltinDeps {
        bus: bus.clone(),
        sessions: sessions.clone(),
        memory: memory.clone(),
        tasks: tasks.clone(),
        active_tasks: active_tasks.clone(),
        params: params.clone(),
        sandbox: Arc::new(
            Sandbox::new(SandboxConfig::default(), store.clone())
                .with_docker_binary("/nonexistent/docker"),
        ),
        plan_board: PlanBoard::new(),
        agents: Arc::new(HashMap::new()),
    };
    register_builtin_tools(&registry, &builtin_deps).await;

    let deps = RuntimeDeps {
        bus: bus.clone(),
        registry: registry.clone(),
        params,
        provider: provider.clone(),
        tasks,
        sessions,
        memory,
        active_tasks,
    };

    World {
        bus,
        registry,
        provider,
        deps,
    }
}

pub fn agent_config(agent_id: &str) -> AgentConfig {
    AgentConfig {
        agent_id: agent_id.to_string(),
        channel_id: "ch-1".to_string(),
        key_id: format!("key-{}", agent_id),
        display_name: agent_id.to_string(),
        capabilities: vec![],
        allowed_tools: None,
        circuit_breaker_exempt_tools: vec![],
        max_iterations: None,
        model: None,
    }
}

pub fn channel_config(channel_id: &str) -> ChannelConfig {
    ChannelConfig {
        id: channel_id.to_string(),
        name: format!("{} channel", channel_id),
        description: String::new(),
        allowed_tools: None,
        system_llm_enabled: true,
        mcp_server_ids: vec![],
    }
}

pub fn spawn_runtime(world: &World, agent_id: &str) -> Arc<AgentRuntime> {
    AgentRuntime::new(
        agent_config(agent_id),
        channel_config("ch-1"),
        RuntimeConfig::default(),
        world.deps.clone(),
    )
}
