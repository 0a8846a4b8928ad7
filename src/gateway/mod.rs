//! WebSocket gateway: the duplex transport boundary.
//!
//! Each connection runs the two-layer handshake, becomes a session, and then
//! exchanges JSON envelopes: whitelisted bus events flow out, client
//! emissions and subscription commands flow in.

use crate::auth::{Authenticator, Credential, Principal};
use crate::bus::{Envelope, EventBus, Subscription, SubscriptionFilter, events, is_public_event};
use crate::session::SessionManager;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Frames buffered toward one socket before the forwarder drops deliveries.
const OUTBOUND_BUFFER: usize = 256;

#[derive(Clone)]
pub struct GatewayState {
    pub authenticator: Arc<Authenticator>,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<EventBus>,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok", "version": crate::VERSION }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// First frame of every connection.
#[derive(Debug, serde::Deserialize)]
struct HandshakeFrame {
    #[serde(rename = "domainKey")]
    domain_key: String,
    principal: Option<Credential>,
}

fn handshake_err(code: &str, message: &str) -> String {
    json!({
        "type": "handshake_err",
        "data": { "code": code, "message": message },
        "timestamp": Utc::now(),
    })
    .to_string()
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    // Phase 1: handshake, or close.
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await;
    let Ok(Some(Ok(Message::Text(raw)))) = first else {
        debug!("gateway: connection closed before handshake");
        return;
    };

    let frame: Option<HandshakeFrame> = serde_json::from_str::<Value>(&raw)
        .ok()
        .filter(|v| v["type"] == "handshake")
        .and_then(|v| serde_json::from_value(v["data"].clone()).ok());
    let Some(frame) = frame else {
        let _ = socket
            .send(Message::Text(
                handshake_err("VALIDATION_ERROR", "first frame must be a handshake").into(),
            ))
            .await;
        return;
    };

    let principal = match state
        .authenticator
        .handshake(&frame.domain_key, frame.principal)
        .await
    {
        Ok(principal) => principal,
        Err(e) => {
            // Auth failures close the transport.
            let _ = socket
                .send(Message::Text(
                    handshake_err(e.code().as_str(), &e.to_string()).into(),
                ))
                .await;
            return;
        }
    };

    let session = state.sessions.create(principal.clone()).await;
    let ok_frame = json!({
        "type": "handshake_ok",
        "data": {
            "sessionId": &session.session_id,
            "capabilities": ["events", "subscribe", "monitor", "emit"],
        },
        "timestamp": Utc::now(),
    });
    if socket
        .send(Message::Text(ok_frame.to_string().into()))
        .await
        .is_err()
    {
        state.sessions.remove(&session.session_id).await;
        return;
    }

    // Phase 2: envelope pump. Subscriptions forward into one outbound queue.
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);
    let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // Agent sessions start with a channel-filtered default view; user
    // sessions see all public events until they narrow with subscriptions.
    let initial_filter = match &principal {
        Principal::Agent(binding) => SubscriptionFilter::channel(binding.channel_id.clone()),
        Principal::User(_) => SubscriptionFilter::default(),
    };
    let initial = state
        .bus
        .subscribe_public(initial_filter, &format!("session:{}", session.session_id))
        .await;
    forwarders.push(spawn_forwarder(initial, out_tx.clone()));

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(envelope) = outbound else { break };
                let Ok(payload) = serde_json::to_string(&envelope) else { continue };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break; // client disconnected
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        if let Some(reply) = handle_client_frame(
                            &raw,
                            &principal,
                            &session.session_id,
                            &state,
                            &out_tx,
                            &mut forwarders,
                        )
                        .await
                        {
                            if socket.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("gateway: socket error on {}: {}", session.session_id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Disconnect: drop subscriptions first (no further events flush), then
    // destroy the session, which announces agent.disconnected to peers.
    for task in forwarders {
        task.abort();
    }
    state.sessions.remove(&session.session_id).await;
    info!("gateway: session {} closed", session.session_id);
}

fn spawn_forwarder(
    subscription: Subscription,
    out_tx: mpsc::Sender<Envelope>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            if out_tx.send(envelope).await.is_err() {
                return;
            }
        }
    })
}

/// Handle one client frame. Returns an optional direct reply frame.
async fn handle_client_frame(
    raw: &str,
    principal: &Principal,
    session_id: &str,
    state: &GatewayState,
    out_tx: &mpsc::Sender<Envelope>,
    forwarders: &mut Vec<tokio::task::JoinHandle<()>>,
) -> Option<String> {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Some(
                json!({
                    "type": "error",
                    "data": { "code": "VALIDATION_ERROR", "message": format!("invalid envelope: {e}") },
                    "timestamp": Utc::now(),
                })
                .to_string(),
            );
        }
    };

    match envelope.event_type.as_str() {
        "subscribe" => {
            let topic = envelope.data["topic"].as_str().map(ToString::to_string);
            let channel_id = envelope.data["channelId"].as_str().map(ToString::to_string);
            let filter = SubscriptionFilter { topic, channel_id: channel_id.clone() };
            let subscription = state
                .bus
                .subscribe_public(filter, &format!("session:{}", session_id))
                .await;
            let subscription_id = subscription.id();
            if let Some(channel_id) = channel_id {
                state.sessions.subscribe_channel(session_id, &channel_id).await;
            }
            forwarders.push(spawn_forwarder(subscription, out_tx.clone()));
            Some(
                json!({
                    "type": "subscribed",
                    "data": { "subscriptionId": subscription_id },
                    "timestamp": Utc::now(),
                })
                .to_string(),
            )
        }
        "monitor" => {
            // Observer-only channel view: all whitelisted events of one
            // channel, regardless of emitter.
            let Some(channel_id) = envelope.data["channelId"].as_str() else {
                return Some(
                    json!({
                        "type": "error",
                        "data": { "code": "MISSING_REQUIRED", "message": "monitor requires channelId" },
                        "timestamp": Utc::now(),
                    })
                    .to_string(),
                );
            };
            let subscription = state
                .bus
                .subscribe_public(
                    SubscriptionFilter::channel(channel_id),
                    &format!("monitor:{}:{}", session_id, channel_id),
                )
                .await;
            forwarders.push(spawn_forwarder(subscription, out_tx.clone()));
            Some(
                json!({
                    "type": "monitoring",
                    "data": { "channelId": channel_id },
                    "timestamp": Utc::now(),
                })
                .to_string(),
            )
        }
        _ => {
            let Some(sanitized) = sanitize_emission(principal, envelope) else {
                return Some(
                    json!({
                        "type": "error",
                        "data": { "code": "OPERATION_FAILED", "message": "event type not emittable" },
                        "timestamp": Utc::now(),
                    })
                    .to_string(),
                );
            };
            let report = state.bus.emit(sanitized).await;
            if report.failed.is_empty() {
                None
            } else {
                warn!(
                    "gateway: {} deliveries failed for session {}",
                    report.failed.len(),
                    session_id
                );
                Some(
                    json!({
                        "type": "error",
                        "data": { "code": "TIMEOUT", "message": "MESSAGE_SEND_FAILED" },
                        "timestamp": Utc::now(),
                    })
                    .to_string(),
                )
            }
        }
    }
}

/// Gate and rewrite a client emission: only whitelisted event types cross
/// into the bus, the emitter identity is stamped from the verified
/// principal, and agent sessions cannot emit into foreign channels.
pub(crate) fn sanitize_emission(principal: &Principal, mut envelope: Envelope) -> Option<Envelope> {
    if !is_public_event(&envelope.event_type) {
        return None;
    }
    // Monitors are read-only by construction; lifecycle events are
    // server-emitted only.
    if envelope.event_type.starts_with("agent.")
        && envelope.event_type != events::AGENT_ERROR
    {
        return None;
    }
    match principal {
        Principal::Agent(binding) => {
            envelope.agent_id = Some(binding.agent_id.clone());
            envelope.channel_id = Some(binding.channel_id.clone());
        }
        Principal::User(identity) => {
            envelope.agent_id = Some(format!("user:{}", identity.user_id));
        }
    }
    envelope.timestamp = Utc::now();
    Some(envelope)
}

#[cfg(test)]
mod tests;
