use super::*;
use crate::auth::{AgentBinding, MemoryCredentialStore, UserIdentity};
use serde_json::json;
use tower::util::ServiceExt;

fn state() -> GatewayState {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(MemoryCredentialStore::new());
    GatewayState {
        authenticator: Arc::new(Authenticator::new("0123456789abcdef0123456789abcdef", store)),
        sessions: Arc::new(SessionManager::new(bus.clone())),
        bus,
    }
}

fn agent_principal() -> Principal {
    Principal::Agent(AgentBinding {
        agent_id: "agent-1".to_string(),
        channel_id: "ch-1".to_string(),
        key_id: "key-1".to_string(),
    })
}

fn user_principal() -> Principal {
    Principal::User(UserIdentity {
        user_id: "u1".to_string(),
        display_name: "Avery".to_string(),
    })
}

#[tokio::test]
async fn health_endpoint_responds() {
    use axum::http::Request;

    let app = build_router(state());
    let req = Request::builder()
        .uri("/api/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::OK);

    let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "ok");
}

#[test]
fn emission_requires_whitelisted_type() {
    let envelope = Envelope::new("session.created", json!({}));
    assert!(sanitize_emission(&agent_principal(), envelope).is_none());

    let envelope = Envelope::new("message.received", json!({ "content": "hi" }));
    assert!(sanitize_emission(&agent_principal(), envelope).is_some());
}

#[test]
fn agent_emissions_are_pinned_to_their_channel() {
    let envelope = Envelope::new("message.received", json!({})).with_channel("ch-forged");
    let sanitized = sanitize_emission(&agent_principal(), envelope).unwrap();
    assert_eq!(sanitized.channel_id.as_deref(), Some("ch-1"));
    assert_eq!(sanitized.agent_id.as_deref(), Some("agent-1"));
}

#[test]
fn user_emissions_carry_user_identity() {
    let envelope = Envelope::new("message.received", json!({})).with_channel("ch-2");
    let sanitized = sanitize_emission(&user_principal(), envelope).unwrap();
    assert_eq!(sanitized.agent_id.as_deref(), Some("user:u1"));
    // Users may address any channel they are authorized to talk to.
    assert_eq!(sanitized.channel_id.as_deref(), Some("ch-2"));
}

#[test]
fn lifecycle_events_cannot_be_forged() {
    for event_type in ["agent.connected", "agent.disconnected", "agent.registered"] {
        let envelope = Envelope::new(event_type, json!({}));
        assert!(
            sanitize_emission(&agent_principal(), envelope).is_none(),
            "{event_type} must be server-emitted only"
        );
    }
    // agent.error is a legitimate client-side report.
    let envelope = Envelope::new("agent.error", json!({ "type": "tool" }));
    assert!(sanitize_emission(&agent_principal(), envelope).is_some());
}
