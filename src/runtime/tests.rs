use super::*;
use crate::bus::SubscriptionFilter;
use crate::config::{ParamsConfig, SandboxConfig};
use crate::conversation::Role;
use crate::memory::SqliteStore;
use crate::params::{OverrideScope, ParamPatch};
use crate::providers::base::{InferenceParams, InferenceResponse, TokenUsage, ToolDefinition};
use crate::sandbox::Sandbox;
use crate::tasks::TaskPriority;
use crate::tools::builtin::{BuiltinDeps, PlanBoard, register_builtin_tools};
use crate::tools::registry::{ToolScope, ToolSource};
use crate::tools::Tool;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;

/// Provider fed a script of responses; records the params of every call.
struct ScriptedProvider {
    script: StdMutex<VecDeque<InferenceResponse>>,
    seen_params: StdMutex<Vec<InferenceParams>>,
    seen_messages: StdMutex<Vec<Vec<ConversationMessage>>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<InferenceResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: StdMutex::new(responses.into()),
            seen_params: StdMutex::new(Vec::new()),
            seen_messages: StdMutex::new(Vec::new()),
        })
    }

    fn text(content: &str) -> InferenceResponse {
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

    fn with_calls(calls: Vec<ToolCall>) -> InferenceResponse {
        InferenceResponse {
            content: None,
            tool_calls: calls,
            usage: TokenUsage::default(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }

    fn calls_made(&self) -> usize {
        self.seen_params.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn infer(&self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        self.seen_params.lock().unwrap().push(request.params.clone());
        self.seen_messages.lock().unwrap().push(request.messages);
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| Self::text("ok")))
    }

    fn default_model(&self) -> &str {
        "model-a"
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Reads a file"
    }
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": { "path": { "type": "string" } } })
    }
    async fn execute(
        &self,
        _args: Value,
        _ctx: &crate::tools::ExecutionContext,
    ) -> anyhow::Result<crate::tools::ToolResult> {
        Ok(crate::tools::ToolResult::new("Success"))
    }
}

struct Harness {
    runtime: Arc<AgentRuntime>,
    provider: Arc<ScriptedProvider>,
    deps: RuntimeDeps,
}

async fn harness(responses: Vec<InferenceResponse>) -> Harness {
    harness_with(responses, RuntimeConfig::default(), None).await
}

async fn harness_with(
    responses: Vec<InferenceResponse>,
    config: RuntimeConfig,
    allowed_tools: Option<Vec<String>>,
) -> Harness {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let provider = ScriptedProvider::new(responses);
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
    registry
        .register(Arc::new(EchoTool), ToolSource::Builtin, ToolScope::Global)
        .await;

    let deps = RuntimeDeps {
        bus,
        registry,
        params,
        provider: provider.clone(),
        tasks,
        sessions,
        memory,
        active_tasks,
    };

    let agent = AgentConfig {
        agent_id: "agent-1".to_string(),
        channel_id: "ch-1".to_string(),
        key_id: "key-1".to_string(),
        display_name: "Agent One".to_string(),
        capabilities: vec![],
        allowed_tools,
        circuit_breaker_exempt_tools: vec![],
        max_iterations: None,
        model: None,
    };
    let channel = ChannelConfig {
        id: "ch-1".to_string(),
        name: "research".to_string(),
        description: String::new(),
        allowed_tools: None,
        system_llm_enabled: true,
        mcp_server_ids: vec![],
    };

    let runtime = AgentRuntime::new(agent, channel, config, deps.clone());
    Harness {
        runtime,
        provider,
        deps,
    }
}

fn peer_message(content: &str) -> AgentEvent {
    AgentEvent::PeerMessage {
        from: "agent-2".to_string(),
        content: content.to_string(),
    }
}

#[tokio::test]
async fn plain_response_completes_in_one_iteration() {
    let h = harness(vec![ScriptedProvider::text("hello back")]).await;
    let sub = h
        .deps
        .bus
        .subscribe(SubscriptionFilter::topic("message.sent"), "t")
        .await;

    h.runtime.handle_event(peer_message("hello")).await;

    assert_eq!(h.provider.calls_made(), 1);
    let sent = sub.recv().await.unwrap();
    assert_eq!(sent.data["content"], "hello back");
    assert_eq!(sent.channel_id.as_deref(), Some("ch-1"));

    let conversation = h.runtime.conversation_snapshot().await;
    assert_eq!(conversation.len(), 2);
    assert_eq!(conversation[0].role, Role::User);
    // Peer input is attributed in the stored history.
    assert_eq!(conversation[0].agent_id.as_deref(), Some("agent-2"));
}

#[tokio::test]
async fn tool_results_are_paired_in_tool_call_id_order() {
    // Two identical-content results must both survive, ordered by id even
    // though the assistant listed them in reverse.
    let h = harness(vec![
        ScriptedProvider::with_calls(vec![
            ToolCall::new("tc2", "read_file", json!({ "path": "/b" })),
            ToolCall::new("tc1", "read_file", json!({ "path": "/a" })),
        ]),
        ScriptedProvider::text("both read"),
    ])
    .await;

    h.runtime.handle_event(peer_message("read both files")).await;

    let conversation = h.runtime.conversation_snapshot().await;
    // user, assistant(calls), tool(tc1), tool(tc2), assistant(final)
    assert_eq!(conversation.len(), 5);
    assert_eq!(conversation[1].tool_calls.len(), 2);
    assert_eq!(conversation[2].tool_call_id.as_deref(), Some("tc1"));
    assert_eq!(conversation[2].content, "Success");
    assert_eq!(conversation[3].tool_call_id.as_deref(), Some("tc2"));
    assert_eq!(conversation[3].content, "Success");
    assert_eq!(conversation[4].role, Role::Assistant);

    // Second inference happened without a pairing violation.
    assert_eq!(h.provider.calls_made(), 2);
}

#[tokio::test]
async fn forbidden_tool_gets_synthetic_result_and_turn_continues() {
    let h = harness_with(
        vec![
            ScriptedProvider::with_calls(vec![ToolCall::new(
                "tc1",
                "read_file",
                json!({ "path": "/etc/passwd" }),
            )]),
            ScriptedProvider::text("understood"),
        ],
        RuntimeConfig::default(),
        Some(vec!["messaging_send".to_string()]),
    )
    .await;

    h.runtime.handle_event(peer_message("read that file")).await;

    let conversation = h.runtime.conversation_snapshot().await;
    let tool_msg = conversation
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("tc1"))
        .expect("synthetic result must be paired");
    let body: Value = serde_json::from_str(&tool_msg.content).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "TOOL_FORBIDDEN");

    // The next inference still proceeded.
    assert_eq!(h.provider.calls_made(), 2);
}

#[tokio::test]
async fn iteration_limit_forces_terminal_message() {
    let mut config = RuntimeConfig::default();
    config.max_iterations = 3;
    // The script always asks for another tool call with fresh args, so only
    // the iteration cap can stop the loop.
    let responses: Vec<InferenceResponse> = (0..10)
        .map(|i| {
            ScriptedProvider::with_calls(vec![ToolCall::new(
                format!("tc{}", i),
                "read_file",
                json!({ "path": format!("/f{}", i) }),
            )])
        })
        .collect();
    let h = harness_with(responses, config, None).await;

    h.runtime.handle_event(peer_message("loop forever")).await;

    assert_eq!(h.provider.calls_made(), 3);
    let conversation = h.runtime.conversation_snapshot().await;
    let last = conversation.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, ITERATION_LIMIT_MESSAGE);
    // Every issued call still has its paired result.
    let mut history = ConversationHistory::new();
    for message in conversation {
        history.append(message);
    }
    assert!(history.unanswered_tool_calls().is_empty());
}

#[tokio::test]
async fn repeated_identical_calls_trip_the_breaker() {
    let mut config = RuntimeConfig::default();
    config.breaker_threshold = 2;
    config.max_iterations = 10;
    let responses: Vec<InferenceResponse> = (0..6)
        .map(|i| {
            ScriptedProvider::with_calls(vec![ToolCall::new(
                format!("tc{}", i),
                "read_file",
                json!({ "path": "/same" }),
            )])
        })
        .collect();
    let h = harness_with(responses, config, None).await;
    let sub = h
        .deps
        .bus
        .subscribe(SubscriptionFilter::topic("controlloop.reflection"), "t")
        .await;

    h.runtime.handle_event(peer_message("keep reading")).await;

    let conversation = h.runtime.conversation_snapshot().await;
    let circuit_open = conversation.iter().any(|m| {
        m.role == Role::Tool && m.content.contains("CIRCUIT_OPEN")
    });
    assert!(circuit_open, "expected a CIRCUIT_OPEN synthetic result");

    // The trip forces a reflection turn, announced on the bus.
    let reflection = sub.recv().await.unwrap();
    assert!(
        reflection.data["trigger"]
            .as_str()
            .unwrap()
            .contains("circuit breaker")
    );
}

#[tokio::test]
async fn next_call_override_applies_to_exactly_one_inference() {
    let h = harness(vec![
        ScriptedProvider::with_calls(vec![ToolCall::new(
            "tc1",
            "read_file",
            json!({ "path": "/a" }),
        )]),
        ScriptedProvider::text("done"),
    ])
    .await;

    h.deps
        .params
        .request_override(
            "agent-1",
            "ch-1",
            "session default",
            ParamPatch {
                temperature: Some(0.8),
                ..ParamPatch::default()
            },
            OverrideScope::Session,
            None,
        )
        .unwrap();
    h.deps
        .params
        .request_override(
            "agent-1",
            "ch-1",
            "one cold call",
            ParamPatch {
                temperature: Some(0.6),
                ..ParamPatch::default()
            },
            OverrideScope::NextCall,
            None,
        )
        .unwrap();

    h.runtime.handle_event(peer_message("go")).await;

    let seen = h.provider.seen_params.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!((seen[0].temperature - 0.6).abs() < 1e-6, "next_call wins once");
    assert!((seen[1].temperature - 0.8).abs() < 1e-6, "session resumes after");
}

#[tokio::test]
async fn task_assignment_runs_to_completion_via_tool() {
    let h = harness(vec![ScriptedProvider::with_calls(vec![ToolCall::new(
        "tc1",
        "task_complete",
        json!({ "summary": "indexed everything", "success": true }),
    )])])
    .await;

    let task = h
        .deps
        .tasks
        .create("ch-1", "index", "index the corpus", TaskPriority::Normal, "user-1")
        .await
        .unwrap();
    h.deps.tasks.assign(&task.task_id, "agent-1").await.unwrap();

    h.runtime
        .handle_event(AgentEvent::TaskAssigned {
            task_id: task.task_id.clone(),
        })
        .await;

    let task = h.deps.tasks.get(&task.task_id).unwrap();
    assert_eq!(task.status, crate::tasks::TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("indexed everything"));
    // Terminal via tool: exactly one inference.
    assert_eq!(h.provider.calls_made(), 1);
    assert!(h.deps.active_tasks.read().await.is_empty());
}

#[tokio::test]
async fn no_further_action_ends_the_turn() {
    let h = harness(vec![ScriptedProvider::with_calls(vec![ToolCall::new(
        "tc1",
        "no_further_action",
        json!({ "reason": "nothing to do" }),
    )])])
    .await;

    h.runtime.handle_event(peer_message("fyi only")).await;
    assert_eq!(h.provider.calls_made(), 1);
}

#[tokio::test]
async fn cancel_before_input_drops_the_turn() {
    let h = harness(vec![]).await;
    let handle = h.runtime.clone().spawn();

    handle.cancel();
    handle.events.send(peer_message("too late")).await.unwrap();
    // Give the loop a beat to process.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(h.provider.calls_made(), 0);
    assert_eq!(handle.state().await, RuntimeState::Idle);
    handle.task.abort();
}

#[tokio::test]
async fn system_prompt_documents_only_callable_tools() {
    let h = harness_with(
        vec![ScriptedProvider::text("ok")],
        RuntimeConfig::default(),
        Some(vec!["messaging_send".to_string()]),
    )
    .await;

    h.runtime.handle_event(peer_message("hi")).await;

    let messages = h.provider.seen_messages.lock().unwrap();
    let system = &messages[0][0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("messaging_send"));
    assert!(!system.content.contains("read_file"));
    // Attribution prefix on the replayed peer message.
    assert!(messages[0][1].content.starts_with("[agent-2]: "));
}

#[tokio::test]
async fn inference_failure_surfaces_as_reflection_and_ends_turn() {
    struct FailingProvider;
    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn infer(&self, _request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
            Err(MxfError::Auth {
                code: crate::errors::ErrorCode::AuthInvalidKey,
                message: "key rotated".to_string(),
            }
            .into())
        }
        fn default_model(&self) -> &str {
            "model-a"
        }
    }

    let h = harness(vec![]).await;
    let mut deps = h.deps.clone();
    deps.provider = Arc::new(FailingProvider);
    let runtime = AgentRuntime::new(
        AgentConfig {
            agent_id: "agent-9".to_string(),
            channel_id: "ch-1".to_string(),
            key_id: "k".to_string(),
            display_name: String::new(),
            capabilities: vec![],
            allowed_tools: None,
            circuit_breaker_exempt_tools: vec![],
            max_iterations: None,
            model: None,
        },
        ChannelConfig {
            id: "ch-1".to_string(),
            name: "research".to_string(),
            description: String::new(),
            allowed_tools: None,
            system_llm_enabled: true,
            mcp_server_ids: vec![],
        },
        RuntimeConfig::default(),
        deps.clone(),
    );
    let sub = deps
        .bus
        .subscribe(SubscriptionFilter::topic("controlloop.reflection"), "t")
        .await;

    runtime.handle_event(peer_message("hello")).await;

    // The failure became a reflection trigger instead of a crash.
    let reflection = sub.recv().await.unwrap();
    assert!(
        reflection.data["trigger"]
            .as_str()
            .unwrap()
            .contains("inference failed")
    );
}
