use super::*;
use crate::bus::SubscriptionFilter;
use crate::config::{ParamsConfig, SandboxConfig};
use crate::memory::{MemoryAccessor, MemoryEntry, MemoryScope, SqliteStore};
use crate::tasks::TaskPriority;
use crate::tools::ExecutionContext;
use crate::tools::registry::AgentToolProfile;
use serde_json::{Value, json};

async fn harness() -> (Arc<ToolRegistry>, BuiltinDeps) {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = Arc::new(ToolRegistry::new(bus.clone()));
    let deps = BuiltinDeps {
        bus: bus.clone(),
        sessions: Arc::new(SessionManager::new(bus.clone())),
        memory: Arc::new(MemoryService::new(store.clone())),
        tasks: Arc::new(TaskService::new(store.clone(), bus.clone())),
        active_tasks: ActiveTaskMap::default(),
        params: Arc::new(ParamService::new(ParamsConfig::default(), "model-a")),
        sandbox: Arc::new(
            Sandbox::new(SandboxConfig::default(), store).with_docker_binary("/nonexistent/docker"),
        ),
        plan_board: PlanBoard::new(),
        agents: Arc::new(HashMap::new()),
    };
    register_builtin_tools(&registry, &deps).await;
    (registry, deps)
}

fn ctx() -> ExecutionContext {
    ExecutionContext::new("agent-1", "ch-1", "tc-1")
}

async fn invoke(registry: &ToolRegistry, name: &str, args: Value) -> Value {
    let result = registry
        .invoke(name, args, &ctx(), &AgentToolProfile::default())
        .await
        .unwrap();
    serde_json::from_str(&result.content).unwrap_or(Value::String(result.content))
}

#[tokio::test]
async fn full_builtin_surface_is_registered() {
    let (registry, _deps) = harness().await;
    for name in [
        "messaging_send",
        "messaging_discover",
        "messaging_coordinate",
        "messaging_broadcast",
        "agent_context_read",
        "agent_memory_read",
        "channel_context_read",
        "channel_memory_read",
        "task_complete",
        "no_further_action",
        "tools_discover",
        "tools_validate",
        "tools_recommend",
        "request_inference_params",
        "get_current_params",
        "get_parameter_status",
        "get_available_models",
        "get_parameter_cost_analytics",
        "reset_inference_params",
        "code_execute",
        "planning_create",
        "planning_share",
        "planning_update_item",
        "planning_view",
    ] {
        assert!(
            registry
                .resolve(name, "ch-1", &AgentToolProfile::default())
                .await
                .is_ok(),
            "{name} should be registered"
        );
    }
}

#[tokio::test]
async fn messaging_send_emits_channel_message() {
    let (registry, deps) = harness().await;
    let sub = deps
        .bus
        .subscribe(SubscriptionFilter::topic("message.received"), "t")
        .await;

    let result = invoke(
        &registry,
        "messaging_send",
        json!({ "targetAgentId": "agent-2", "message": "hello" }),
    )
    .await;
    assert_eq!(result["success"], true);

    let envelope = sub.recv().await.unwrap();
    assert_eq!(envelope.channel_id.as_deref(), Some("ch-1"));
    assert_eq!(envelope.data["from"], "agent-1");
    assert_eq!(envelope.data["to"], "agent-2");
    assert_eq!(envelope.data["message"], "hello");
}

#[tokio::test]
async fn memory_read_tools_honor_scope() {
    let (registry, deps) = harness().await;
    let accessor = MemoryAccessor::agent("agent-1", "ch-1");
    deps.memory
        .put(
            &accessor,
            &MemoryScope::Agent("agent-1".to_string()),
            &MemoryEntry {
                key: "note".to_string(),
                value: json!("private note"),
                entry_type: "text".to_string(),
                metadata: json!({ "tags": ["scratch"] }),
                expires_at: None,
            },
        )
        .unwrap();
    deps.memory
        .put(
            &accessor,
            &MemoryScope::Channel("ch-1".to_string()),
            &MemoryEntry {
                key: "topic".to_string(),
                value: json!("shared topic"),
                entry_type: "text".to_string(),
                metadata: json!({}),
                expires_at: None,
            },
        )
        .unwrap();

    let agent_read = invoke(&registry, "agent_context_read", json!({})).await;
    assert_eq!(agent_read["entries"]["note"], "private note");
    assert!(agent_read["entries"]["topic"].is_null());

    let channel_read = invoke(&registry, "channel_context_read", json!({})).await;
    assert_eq!(channel_read["entries"]["topic"], "shared topic");

    // Tag filter on the memory variant.
    let tagged = invoke(
        &registry,
        "agent_memory_read",
        json!({ "tags": ["scratch"] }),
    )
    .await;
    assert_eq!(tagged["count"], 1);
    let untagged = invoke(
        &registry,
        "agent_memory_read",
        json!({ "tags": ["elsewhere"] }),
    )
    .await;
    assert_eq!(untagged["count"], 0);
}

#[tokio::test]
async fn task_complete_requires_an_active_task() {
    let (registry, deps) = harness().await;

    let no_task = registry
        .invoke(
            "task_complete",
            json!({ "summary": "done" }),
            &ctx(),
            &AgentToolProfile::default(),
        )
        .await
        .unwrap();
    assert!(no_task.is_error);

    let task = deps
        .tasks
        .create("ch-1", "do a thing", "", TaskPriority::Normal, "user-1")
        .await
        .unwrap();
    deps.tasks.assign(&task.task_id, "agent-1").await.unwrap();
    deps.active_tasks
        .write()
        .await
        .insert("agent-1".to_string(), task.task_id.clone());

    let completed = invoke(&registry, "task_complete", json!({ "summary": "all done" })).await;
    assert_eq!(completed["success"], true);
    assert_eq!(completed["taskId"], task.task_id.as_str());
    assert!(deps.active_tasks.read().await.is_empty());
}

#[tokio::test]
async fn tools_discover_and_validate_see_the_surface() {
    let (registry, _deps) = harness().await;

    let discovered = invoke(
        &registry,
        "tools_discover",
        json!({ "category": "messaging" }),
    )
    .await;
    assert_eq!(discovered["count"], 4);

    let validated = invoke(
        &registry,
        "tools_validate",
        json!({ "toolNames": ["messaging_send", "not_a_tool"] }),
    )
    .await;
    assert_eq!(validated["results"][0]["valid"], true);
    assert_eq!(validated["results"][1]["valid"], false);
    assert_eq!(validated["results"][1]["error"], "TOOL_NOT_FOUND");
}

#[tokio::test]
async fn tools_recommend_ranks_by_intent() {
    let (registry, _deps) = harness().await;
    let recommended = invoke(
        &registry,
        "tools_recommend",
        json!({ "intent": "send a message to another agent" }),
    )
    .await;
    let names: Vec<&str> = recommended["recommendations"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["name"].as_str())
        .collect();
    assert!(names.contains(&"messaging_send"), "got {names:?}");
}

#[tokio::test]
async fn params_tools_round_trip() {
    let (registry, _deps) = harness().await;

    let response = invoke(
        &registry,
        "request_inference_params",
        json!({
            "reason": "long synthesis ahead",
            "suggested": { "maxOutputTokens": 12000 },
            "scope": "session"
        }),
    )
    .await;
    assert_eq!(response["status"], "approved");

    let status = invoke(&registry, "get_parameter_status", json!({})).await;
    assert_eq!(status["count"], 1);

    let reset = invoke(&registry, "reset_inference_params", json!({ "scope": "session" })).await;
    assert_eq!(reset["resetCount"], 1);

    let models = invoke(&registry, "get_available_models", json!({})).await;
    assert_eq!(models["models"][0], "model-a");
}

#[tokio::test]
async fn planning_lifecycle_emits_plan_events() {
    let (registry, deps) = harness().await;
    let sub = deps
        .bus
        .subscribe(SubscriptionFilter::topic("controlloop.plan"), "t")
        .await;

    let created = invoke(
        &registry,
        "planning_create",
        json!({ "title": "rollout", "items": ["draft", "review"] }),
    )
    .await;
    let plan_id = created["planId"].as_str().unwrap().to_string();
    let item_id = created["itemIds"][0].as_str().unwrap().to_string();

    invoke(&registry, "planning_share", json!({ "planId": &plan_id })).await;
    let shared = sub.recv().await.unwrap();
    assert_eq!(shared.data["title"], "rollout");

    let updated = invoke(
        &registry,
        "planning_update_item",
        json!({ "planId": &plan_id, "itemId": &item_id, "status": "done" }),
    )
    .await;
    assert_eq!(updated["success"], true);
    // Shared plan updates are re-announced.
    let announced = sub.recv().await.unwrap();
    assert_eq!(announced.data["items"][0]["status"], "done");

    let viewed = invoke(&registry, "planning_view", json!({ "planId": &plan_id })).await;
    assert_eq!(viewed["items"][0]["status"], "done");
}

#[tokio::test]
async fn code_execute_surfaces_sandbox_outcome() {
    let (registry, _deps) = harness().await;
    let result = registry
        .invoke(
            "code_execute",
            json!({ "code": "eval(\"x\")" }),
            &ctx(),
            &AgentToolProfile::default(),
        )
        .await
        .unwrap();
    assert!(result.is_error);
    let payload: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(payload["success"], false);
    assert!(payload["error"].as_str().unwrap().contains("VALIDATION_ERROR"));
    assert_eq!(payload["codeHash"].as_str().unwrap().len(), 16);
}
