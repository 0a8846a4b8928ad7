use super::*;
use crate::bus::EventBus;
use crate::tools::registry::AgentToolProfile;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn http_config(id: &str, url: String) -> ExternalServerConfig {
    ExternalServerConfig {
        id: id.to_string(),
        name: format!("{} server", id),
        transport: McpTransportKind::Http,
        command: None,
        args: vec![],
        url: Some(url),
        env: std::collections::HashMap::new(),
        auto_start: true,
        restart_on_crash: true,
        max_restart_attempts: 3,
        health_check_interval_secs: 1,
        startup_timeout_secs: 5,
        keep_alive_minutes: None,
    }
}

async fn mock_mcp_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "initialize" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": { "capabilities": {} }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "tools/list" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 2,
            "result": { "tools": [
                { "name": "remote_lookup", "description": "remote",
                  "inputSchema": { "type": "object" } }
            ] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "tools/call" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 3,
            "result": { "content": [ { "type": "text", "text": "found" } ], "isError": false }
        })))
        .mount(&server)
        .await;
    server
}

fn registry() -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::new(Arc::new(EventBus::new())))
}

#[test]
fn restart_backoff_grows_and_caps() {
    let first = restart_backoff(0);
    assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1000));

    let late = restart_backoff(20);
    assert!(late <= Duration::from_millis(60_000));
    assert!(late >= Duration::from_millis(30_000));
}

#[test]
fn activity_tracker_reports_idle_time() {
    let tracker = ActivityTracker::default();
    assert!(tracker.idle_for("srv").is_none());
    tracker.touch("srv");
    assert!(tracker.idle_for("srv").unwrap() < Duration::from_secs(1));
}

#[tokio::test]
async fn register_start_discovers_and_registers_tools() {
    let mock = mock_mcp_server().await;
    let registry = registry();
    let manager = ExternalServerManager::new(registry.clone());

    manager
        .register(http_config("srv-1", mock.uri()), ToolScope::Global)
        .await
        .unwrap();

    assert_eq!(
        manager.server_state("srv-1").await,
        Some(ServerState::Ready)
    );
    let (_, source) = registry
        .resolve("remote_lookup", "ch-1", &AgentToolProfile::default())
        .await
        .unwrap();
    assert_eq!(
        source,
        ToolSource::External {
            server_id: "srv-1".to_string()
        }
    );
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let mock = mock_mcp_server().await;
    let manager = ExternalServerManager::new(registry());

    manager
        .register(http_config("srv-1", mock.uri()), ToolScope::Global)
        .await
        .unwrap();
    let err = manager
        .register(http_config("srv-1", mock.uri()), ToolScope::Global)
        .await
        .unwrap_err();
    assert_eq!(err.code(), crate::errors::ErrorCode::AlreadyExists);
}

#[tokio::test]
async fn startup_failure_marks_failed() {
    let registry = registry();
    let manager = ExternalServerManager::new(registry.clone());

    // Nothing is listening on this port.
    let mut config = http_config("srv-dead", "http://127.0.0.1:1/".to_string());
    config.startup_timeout_secs = 2;
    manager.register(config, ToolScope::Global).await.unwrap();

    assert_eq!(
        manager.server_state("srv-dead").await,
        Some(ServerState::Failed)
    );
    assert!(
        registry
            .resolve("remote_lookup", "ch-1", &AgentToolProfile::default())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn health_failures_flip_ready_to_failed_and_unregister_tools() {
    let mock = mock_mcp_server().await;
    let registry = registry();
    let manager = ExternalServerManager::new(registry.clone());
    manager
        .register(http_config("srv-1", mock.uri()), ToolScope::Global)
        .await
        .unwrap();
    assert_eq!(
        manager.server_state("srv-1").await,
        Some(ServerState::Ready)
    );

    // Kill the upstream: probes now fail.
    drop(mock);
    for _ in 0..3 {
        manager.supervise_once("srv-1").await;
        // A failed probe may have already pinned the state; stop early.
        if manager.server_state("srv-1").await == Some(ServerState::Failed) {
            break;
        }
    }

    assert_eq!(
        manager.server_state("srv-1").await,
        Some(ServerState::Failed)
    );
    // Agents now observe the tools as absent.
    let err = registry
        .resolve("remote_lookup", "ch-1", &AgentToolProfile::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), crate::errors::ErrorCode::ToolNotFound);
}

#[tokio::test]
async fn failed_restarts_pin_after_cap() {
    let registry = registry();
    let manager = ExternalServerManager::new(registry.clone());
    let mut config = http_config("srv-dead", "http://127.0.0.1:1/".to_string());
    config.startup_timeout_secs = 1;
    config.max_restart_attempts = 2;
    manager.register(config, ToolScope::Global).await.unwrap();
    assert_eq!(
        manager.server_state("srv-dead").await,
        Some(ServerState::Failed)
    );

    // Two allowed restart attempts, both fail, then pinned.
    for _ in 0..4 {
        manager.supervise_once("srv-dead").await;
    }
    assert_eq!(
        manager.server_state("srv-dead").await,
        Some(ServerState::Failed)
    );

    // Manual unregister is the only way out.
    manager.unregister("srv-dead").await.unwrap();
    assert_eq!(manager.server_state("srv-dead").await, None);
}

#[tokio::test]
async fn keepalive_expiry_stops_channel_scoped_server() {
    let mock = mock_mcp_server().await;
    let registry = registry();
    let manager = ExternalServerManager::new(registry.clone());

    let mut config = http_config("srv-ch", mock.uri());
    config.keep_alive_minutes = Some(0); // expire immediately on idleness
    manager
        .register(config, ToolScope::Channel("ch-1".to_string()))
        .await
        .unwrap();
    assert_eq!(
        manager.server_state("srv-ch").await,
        Some(ServerState::Ready)
    );

    manager.supervise_once("srv-ch").await;
    assert_eq!(
        manager.server_state("srv-ch").await,
        Some(ServerState::Stopped)
    );
    assert!(
        registry
            .resolve("remote_lookup", "ch-1", &AgentToolProfile::default())
            .await
            .is_err()
    );

    // A new request in the channel re-starts the stopped server.
    manager.ensure_started("srv-ch").await.unwrap();
    assert_eq!(
        manager.server_state("srv-ch").await,
        Some(ServerState::Ready)
    );
    assert!(
        registry
            .resolve("remote_lookup", "ch-1", &AgentToolProfile::default())
            .await
            .is_ok()
    );
}
