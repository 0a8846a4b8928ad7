//! Component wiring: owned modules threaded through construction.
//!
//! The server builds every service once, spawns one runtime per configured
//! `{agentId, channelId}`, routes bus events into runtime inboxes, and runs
//! the gateway until shutdown.

use crate::auth::{Authenticator, MemoryCredentialStore};
use crate::bus::{EventBus, SubscriptionFilter, events};
use crate::config::Config;
use crate::errors::MxfError;
use crate::gateway::{GatewayState, build_router};
use crate::memory::{MemoryService, SqliteStore};
use crate::params::ParamService;
use crate::providers::{CircuitBreakerProvider, HttpProvider, LlmProvider};
use crate::runtime::{AgentEvent, AgentRuntime, RuntimeDeps, RuntimeHandle};
use crate::sandbox::Sandbox;
use crate::session::SessionManager;
use crate::tasks::{ActiveTaskMap, TaskService};
use crate::tools::builtin::{BuiltinDeps, PlanBoard, register_builtin_tools};
use crate::tools::external::ExternalServerManager;
use crate::tools::registry::{ToolRegistry, ToolScope};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const REVOCATION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct MxfServer {
    config: Config,
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    authenticator: Arc<Authenticator>,
    external: Arc<ExternalServerManager>,
    runtimes: Mutex<HashMap<String, RuntimeHandle>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MxfServer {
    pub async fn new(config: Config) -> Result<Self> {
        let bus = Arc::new(EventBus::with_capacity(
            config.bus.inbox_capacity,
            Duration::from_secs(config.bus.send_timeout_secs),
        ));
        let store = Arc::new(
            SqliteStore::open(std::path::Path::new(&config.store.path))
                .context("failed to open persistent store")?,
        );

        let provider: Arc<dyn LlmProvider> = CircuitBreakerProvider::wrap(
            Arc::new(HttpProvider::new(
                config.provider.endpoint.clone(),
                config.provider.api_key.clone(),
                config.provider.model.clone(),
                config.provider.name.clone(),
            )),
            &config.provider.breaker,
        );

        // Credential store, seeded from config. Agent key secrets come from
        // the environment (MXF_AGENT_SECRET_<keyId>), never the config file.
        let credentials = Arc::new(MemoryCredentialStore::new());
        for agent in &config.agents {
            let env_key = format!(
                "MXF_AGENT_SECRET_{}",
                agent.key_id.replace('-', "_").to_uppercase()
            );
            if let Ok(secret) = std::env::var(&env_key) {
                credentials
                    .add_agent_key(&agent.key_id, secret, &agent.agent_id, &agent.channel_id)
                    .await;
            }
        }
        let authenticator = Arc::new(Authenticator::new(
            config.auth.domain_key.clone(),
            credentials,
        ));

        let sessions = Arc::new(SessionManager::new(bus.clone()));
        let registry = Arc::new(ToolRegistry::new(bus.clone()));
        let memory = Arc::new(MemoryService::new(store.clone()));
        let tasks = Arc::new(TaskService::new(store.clone(), bus.clone()));
        let params = Arc::new(ParamService::new(
            config.params.clone(),
            config.provider.model.clone(),
        ));
        let sandbox = Arc::new(Sandbox::new(config.sandbox.clone(), store.clone()));
        let active_tasks = ActiveTaskMap::default();

        let agents_by_id: Arc<HashMap<String, crate::config::AgentConfig>> = Arc::new(
            config
                .agents
                .iter()
                .map(|a| (a.agent_id.clone(), a.clone()))
                .collect(),
        );

        let builtin_deps = BuiltinDeps {
            bus: bus.clone(),
            sessions: sessions.clone(),
            memory: memory.clone(),
            tasks: tasks.clone(),
            active_tasks: active_tasks.clone(),
            params: params.clone(),
            sandbox,
            plan_board: PlanBoard::new(),
            agents: agents_by_id,
        };
        register_builtin_tools(&registry, &builtin_deps).await;

        for channel in &config.channels {
            registry
                .set_channel_allowed_tools(&channel.id, channel.allowed_tools.clone())
                .await;
        }

        // External MCP servers: channel-referenced configs are channel
        // scoped, the rest are global.
        let external = ExternalServerManager::new(registry.clone());
        for server_config in &config.external_servers {
            let scope = config
                .channels
                .iter()
                .find(|c| c.mcp_server_ids.contains(&server_config.id))
                .map_or(ToolScope::Global, |c| ToolScope::Channel(c.id.clone()));
            if let Err(e) = external.register(server_config.clone(), scope).await {
                warn!("external server '{}' not registered: {}", server_config.id, e);
            }
        }

        let deps = RuntimeDeps {
            bus: bus.clone(),
            registry,
            params,
            provider,
            tasks,
            sessions: sessions.clone(),
            memory,
            active_tasks,
        };

        let server = Self {
            bus,
            sessions,
            authenticator,
            external,
            runtimes: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            config,
        };
        server.spawn_runtimes(&deps).await?;
        server.spawn_router().await;
        server.spawn_sweepers(&deps).await;
        Ok(server)
    }

    async fn spawn_runtimes(&self, deps: &RuntimeDeps) -> Result<()> {
        let mut runtimes = self.runtimes.lock().await;
        for agent in &self.config.agents {
            let channel = self
                .config
                .channels
                .iter()
                .find(|c| c.id == agent.channel_id)
                .ok_or_else(|| {
                    MxfError::Config(format!(
                        "agent '{}' references unknown channel",
                        agent.agent_id
                    ))
                })?;
            if runtimes.contains_key(&agent.agent_id) {
                return Err(MxfError::AlreadyExists(format!(
                    "runtime for agent '{}'",
                    agent.agent_id
                ))
                .into());
            }
            let runtime = AgentRuntime::new(
                agent.clone(),
                channel.clone(),
                self.config.runtime.clone(),
                deps.clone(),
            );
            runtimes.insert(agent.agent_id.clone(), runtime.spawn());
        }
        info!("spawned {} agent runtimes", runtimes.len());
        Ok(())
    }

    /// Route bus traffic into runtime inboxes: direct messages, broadcasts,
    /// task assignments, and task cancellations.
    async fn spawn_router(&self) {
        let subscription = self
            .bus
            .subscribe(SubscriptionFilter::default(), "runtime-router")
            .await;
        let senders: HashMap<String, tokio::sync::mpsc::Sender<AgentEvent>> = {
            let runtimes = self.runtimes.lock().await;
            runtimes
                .iter()
                .map(|(id, handle)| (id.clone(), handle.events.clone()))
                .collect()
        };
        let channel_agents: HashMap<String, Vec<String>> = {
            let mut map: HashMap<String, Vec<String>> = HashMap::new();
            for agent in &self.config.agents {
                map.entry(agent.channel_id.clone())
                    .or_default()
                    .push(agent.agent_id.clone());
            }
            map
        };

        let task = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                match envelope.event_type.as_str() {
                    events::MESSAGE_RECEIVED => {
                        let Some(to) = envelope.data["to"].as_str() else { continue };
                        let from = envelope.data["from"]
                            .as_str()
                            .or(envelope.agent_id.as_deref())
                            .unwrap_or("unknown")
                            .to_string();
                        // An agent's own emission must not echo back to it.
                        if from == to {
                            continue;
                        }
                        let content = envelope.data["message"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        if let Some(sender) = senders.get(to) {
                            let _ = sender
                                .send(AgentEvent::PeerMessage { from, content })
                                .await;
                        }
                    }
                    events::MESSAGE_BROADCAST => {
                        let Some(channel_id) = envelope.channel_id.as_deref() else {
                            continue;
                        };
                        let from = envelope.data["from"]
                            .as_str()
                            .or(envelope.agent_id.as_deref())
                            .unwrap_or("unknown")
                            .to_string();
                        let content = envelope.data["message"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        for agent_id in channel_agents.get(channel_id).into_iter().flatten() {
                            if *agent_id == from {
                                continue;
                            }
                            if let Some(sender) = senders.get(agent_id) {
                                let _ = sender
                                    .send(AgentEvent::ChannelMessage {
                                        from: from.clone(),
                                        content: content.clone(),
                                    })
                                    .await;
                            }
                        }
                    }
                    events::TASK_ASSIGNED => {
                        let Some(assignee) = envelope.data["assigneeAgentId"].as_str() else {
                            continue;
                        };
                        let Some(task_id) = envelope.data["taskId"].as_str() else { continue };
                        if let Some(sender) = senders.get(assignee) {
                            let _ = sender
                                .send(AgentEvent::TaskAssigned {
                                    task_id: task_id.to_string(),
                                })
                                .await;
                        }
                    }
                    events::TASK_CANCELLED => {
                        let Some(assignee) = envelope.data["assigneeAgentId"].as_str() else {
                            continue;
                        };
                        if let Some(sender) = senders.get(assignee) {
                            let _ = sender.send(AgentEvent::Cancel).await;
                        }
                    }
                    _ => {}
                }
            }
        });
        self.background.lock().await.push(task);
    }

    async fn spawn_sweepers(&self, deps: &RuntimeDeps) {
        // Revocation: bounded-interval enforcement for live sessions.
        let sessions = self.sessions.clone();
        let store = self.authenticator.store().clone();
        let revocation = tokio::spawn(async move {
            loop {
                tokio::time::sleep(REVOCATION_SWEEP_INTERVAL).await;
                for session_id in sessions.sweep_revoked(&store).await {
                    warn!("session {} disconnected by revocation sweep", session_id);
                }
            }
        });

        let memory = deps.memory.clone();
        let memory_sweep = tokio::spawn(async move {
            loop {
                tokio::time::sleep(MEMORY_SWEEP_INTERVAL).await;
                match memory.sweep_expired() {
                    Ok(0) => {}
                    Ok(count) => info!("memory sweep removed {} expired entries", count),
                    Err(e) => warn!("memory sweep failed: {}", e),
                }
            }
        });

        let mut background = self.background.lock().await;
        background.push(revocation);
        background.push(memory_sweep);
    }

    /// Serve the gateway until ctrl-c, then shut everything down in order:
    /// listener first, runtimes, then external servers.
    pub async fn run(self) -> Result<()> {
        let state = GatewayState {
            authenticator: self.authenticator.clone(),
            sessions: self.sessions.clone(),
            bus: self.bus.clone(),
        };
        let app = build_router(state);
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!("mxf {} listening on {}", crate::VERSION, addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await
            .context("gateway server failed")?;

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        for (_, handle) in self.runtimes.lock().await.drain() {
            handle.cancel();
            handle.task.abort();
        }
        self.external.shutdown().await;
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        info!("mxf shut down");
    }
}
