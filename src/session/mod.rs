use crate::auth::{CredentialStore, Principal};
use crate::bus::{Envelope, EventBus, events};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// One authenticated transport connection. Exactly one transport handle per
/// session; destroying the session is what `disconnect` means.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub principal: Principal,
    pub connected_at: DateTime<Utc>,
    pub subscribed_channels: HashSet<String>,
}

/// Live session registry. Creation emits `agent.connected` for agent-bound
/// sessions, removal emits `agent.disconnected` to peers.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    bus: Arc<EventBus>,
}

impl SessionManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub async fn create(&self, principal: Principal) -> Session {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            principal: principal.clone(),
            connected_at: Utc::now(),
            subscribed_channels: HashSet::new(),
        };
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());
        info!(
            "session {} created for {}",
            session.session_id,
            principal.label()
        );

        if let Principal::Agent(binding) = &principal {
            self.bus
                .emit(
                    Envelope::new(
                        events::AGENT_CONNECTED,
                        json!({ "agentId": &binding.agent_id }),
                    )
                    .with_channel(binding.channel_id.clone())
                    .with_agent(binding.agent_id.clone()),
                )
                .await;
        }
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn subscribe_channel(&self, session_id: &str, channel_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.subscribed_channels.insert(channel_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Destroy a session. Emits `agent.disconnected` so peers observe the
    /// departure; in-flight external MCP calls are not cancelled (they run
    /// to completion and log).
    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.write().await.remove(session_id)?;
        info!(
            "session {} removed ({})",
            session.session_id,
            session.principal.label()
        );
        if let Principal::Agent(binding) = &session.principal {
            self.bus
                .emit(
                    Envelope::new(
                        events::AGENT_DISCONNECTED,
                        json!({ "agentId": &binding.agent_id }),
                    )
                    .with_channel(binding.channel_id.clone())
                    .with_agent(binding.agent_id.clone()),
                )
                .await;
        }
        Some(session)
    }

    /// Bounded-interval revocation: called periodically; any session whose
    /// credential has been revoked is removed. Returns the removed ids.
    pub async fn sweep_revoked(&self, store: &Arc<dyn CredentialStore>) -> Vec<String> {
        let candidates: Vec<(String, String)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter_map(|s| {
                    s.principal
                        .key_id()
                        .map(|key| (s.session_id.clone(), key.to_string()))
                })
                .collect()
        };

        let mut removed = Vec::new();
        for (session_id, key_id) in candidates {
            if store.is_revoked(&key_id).await {
                debug!("session {}: key {} revoked, disconnecting", session_id, key_id);
                self.remove(&session_id).await;
                removed.push(session_id);
            }
        }
        removed
    }

    /// Active agent ids per channel, for the roster tokens and discovery.
    pub async fn channel_roster(&self, channel_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut roster: Vec<String> = sessions
            .values()
            .filter_map(|s| match &s.principal {
                Principal::Agent(binding) if binding.channel_id == channel_id => {
                    Some(binding.agent_id.clone())
                }
                _ => None,
            })
            .collect();
        roster.sort();
        roster.dedup();
        roster
    }
}
