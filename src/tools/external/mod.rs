pub mod http;
pub mod proxy;

pub use http::HttpMcpClient;
pub use proxy::ExternalProxyTool;

use crate::config::{ExternalServerConfig, McpTransportKind};
use crate::errors::MxfError;
use crate::tools::registry::{ToolRegistry, ToolScope, ToolSource};
use anyhow::{Context, Result};
use rmcp::ServiceExt;
use rmcp::service::{Peer, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::RoleClient;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Consecutive failed health probes before a ready server flips to failed.
const HEALTH_FAILURE_THRESHOLD: u32 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_BACKOFF_BASE_MS: u64 = 1000;
const RESTART_BACKOFF_CAP_MS: u64 = 60_000;

/// External server lifecycle: registered → starting → (ready | failed) →
/// stopped. Crash while ready triggers backoff restart up to the configured
/// cap; exceeding it pins `failed` until manual unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// Live transport to a running server, shared with its proxy tools through a
/// swap slot so restarts do not require re-registration.
#[derive(Clone)]
pub enum Connection {
    Stdio(Peer<RoleClient>),
    Http(HttpMcpClient),
}

/// Exponential backoff with jitter for restart attempt `n` (0-based).
pub(crate) fn restart_backoff(attempts: u32) -> Duration {
    let exp = RESTART_BACKOFF_BASE_MS.saturating_mul(1u64 << attempts.min(16));
    let capped = exp.min(RESTART_BACKOFF_CAP_MS);
    Duration::from_millis(fastrand::u64(capped / 2..=capped))
}

/// Tracks last dispatch per server for channel keepalive expiry.
#[derive(Default)]
pub struct ActivityTracker {
    last: std::sync::Mutex<HashMap<String, Instant>>,
}

impl ActivityTracker {
    pub fn touch(&self, server_id: &str) {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(server_id.to_string(), Instant::now());
    }

    pub fn idle_for(&self, server_id: &str) -> Option<Duration> {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(server_id)
            .map(Instant::elapsed)
    }
}

struct ServerCore {
    state: ServerState,
    /// Stdio process handle. Kept alive while ready; dropped on stop.
    running: Option<RunningService<RoleClient, ()>>,
    restart_attempts: u32,
    consecutive_health_failures: u32,
}

/// One managed server. `core` is the per-server lock serializing start/stop;
/// `connection` is the slot the proxies read.
pub struct ServerHandle {
    config: ExternalServerConfig,
    scope: ToolScope,
    core: Mutex<ServerCore>,
    connection: Arc<RwLock<Option<Connection>>>,
}

impl ServerHandle {
    fn new(config: ExternalServerConfig, scope: ToolScope) -> Self {
        Self {
            config,
            scope,
            core: Mutex::new(ServerCore {
                state: ServerState::Stopped,
                running: None,
                restart_attempts: 0,
                consecutive_health_failures: 0,
            }),
            connection: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn state(&self) -> ServerState {
        self.core.lock().await.state
    }
}

/// Manages the lifecycle of all external MCP servers and keeps the tool
/// registry in sync with what is actually reachable.
pub struct ExternalServerManager {
    servers: RwLock<HashMap<String, Arc<ServerHandle>>>,
    registry: Arc<ToolRegistry>,
    activity: Arc<ActivityTracker>,
    supervisors: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ExternalServerManager {
    pub fn new(registry: Arc<ToolRegistry>) -> Arc<Self> {
        Arc::new(Self {
            servers: RwLock::new(HashMap::new()),
            registry,
            activity: Arc::new(ActivityTracker::default()),
            supervisors: Mutex::new(Vec::new()),
        })
    }

    pub async fn server_state(&self, server_id: &str) -> Option<ServerState> {
        let servers = self.servers.read().await;
        match servers.get(server_id) {
            Some(handle) => Some(handle.state().await),
            None => None,
        }
    }

    /// Register a server. Starts it when `auto_start` is set; a failed start
    /// leaves the registration in place with state `failed` for the
    /// supervisor to retry.
    pub async fn register(
        self: &Arc<Self>,
        config: ExternalServerConfig,
        scope: ToolScope,
    ) -> Result<(), MxfError> {
        let id = config.id.clone();
        {
            let mut servers = self.servers.write().await;
            if servers.contains_key(&id) {
                return Err(MxfError::AlreadyExists(format!("server '{}'", id)));
            }
            servers.insert(id.clone(), Arc::new(ServerHandle::new(config.clone(), scope)));
        }
        info!("external: registered server '{}' ({})", id, config.name);

        if config.auto_start {
            if let Err(e) = self.start(&id).await {
                warn!("external: initial start of '{}' failed: {}", id, e);
            }
        }
        self.spawn_supervisor(&id).await;
        Ok(())
    }

    /// Stop and forget a server. The only way out of a pinned `failed` state.
    pub async fn unregister(&self, server_id: &str) -> Result<(), MxfError> {
        let handle = {
            let mut servers = self.servers.write().await;
            servers
                .remove(server_id)
                .ok_or_else(|| MxfError::NotFound(format!("server '{}'", server_id)))?
        };
        self.shutdown_server(&handle).await;
        info!("external: unregistered server '{}'", server_id);
        Ok(())
    }

    /// Start (or restart after stop) a registered server: connect, run MCP
    /// `initialize` + `tools/list` within the startup timeout, register the
    /// discovered tools.
    pub async fn start(&self, server_id: &str) -> Result<()> {
        let handle = self
            .server(server_id)
            .await
            .context("server not registered")?;

        let mut core = handle.core.lock().await;
        if core.state == ServerState::Ready || core.state == ServerState::Starting {
            return Ok(());
        }
        core.state = ServerState::Starting;
        debug!("external: starting server '{}'", server_id);

        let startup_timeout = Duration::from_secs(handle.config.startup_timeout_secs);
        let startup = self.connect_and_discover(&handle, startup_timeout).await;

        match startup {
            Ok((running, connection, tool_count)) => {
                core.running = running;
                core.state = ServerState::Ready;
                core.restart_attempts = 0;
                core.consecutive_health_failures = 0;
                drop(core);
                *handle.connection.write().await = Some(connection);
                self.activity.touch(server_id);
                info!(
                    "external: server '{}' ready ({} tools)",
                    server_id, tool_count
                );
                Ok(())
            }
            Err(e) => {
                core.state = ServerState::Failed;
                core.running = None;
                drop(core);
                *handle.connection.write().await = None;
                warn!("external: server '{}' failed to start: {}", server_id, e);
                Err(e)
            }
        }
    }

    async fn connect_and_discover(
        &self,
        handle: &Arc<ServerHandle>,
        startup_timeout: Duration,
    ) -> Result<(Option<RunningService<RoleClient, ()>>, Connection, usize)> {
        let config = &handle.config;
        match config.transport {
            McpTransportKind::Stdio => {
                let command = config
                    .command
                    .as_deref()
                    .context("stdio server requires a command")?;
                let mut cmd = Command::new(command);
                cmd.args(&config.args);
                for (k, v) in &config.env {
                    cmd.env(k, v);
                }
                cmd.stdin(std::process::Stdio::piped());
                cmd.stdout(std::process::Stdio::piped());
                cmd.stderr(std::process::Stdio::inherit());

                let transport = TokioChildProcess::new(cmd)?;
                let running = tokio::time::timeout(startup_timeout, ().serve(transport))
                    .await
                    .map_err(|_| anyhow::anyhow!("startup timed out"))?
                    .map_err(|e| anyhow::anyhow!("MCP handshake failed: {}", e))?;

                let peer = running.peer().clone();
                let tools = tokio::time::timeout(startup_timeout, peer.list_all_tools())
                    .await
                    .map_err(|_| anyhow::anyhow!("tools/list timed out"))?
                    .map_err(|e| anyhow::anyhow!("tools/list failed: {}", e))?;

                let connection = Connection::Stdio(peer);
                let count = tools.len();
                for tool in tools {
                    let description = tool.description.as_deref().unwrap_or("").to_string();
                    let input_schema = serde_json::Value::Object((*tool.input_schema).clone());
                    self.register_proxy(
                        handle,
                        tool.name.to_string(),
                        description,
                        input_schema,
                    )
                    .await;
                }
                Ok((Some(running), connection, count))
            }
            McpTransportKind::Http => {
                let url = config.url.as_deref().context("http server requires a url")?;
                let client = HttpMcpClient::new(url);
                tokio::time::timeout(startup_timeout, client.initialize())
                    .await
                    .map_err(|_| anyhow::anyhow!("startup timed out"))??;
                let tools = tokio::time::timeout(startup_timeout, client.list_tools())
                    .await
                    .map_err(|_| anyhow::anyhow!("tools/list timed out"))??;

                let count = tools.len();
                for tool in tools {
                    self.register_proxy(handle, tool.name, tool.description, tool.input_schema)
                        .await;
                }
                Ok((None, Connection::Http(client), count))
            }
        }
    }

    async fn register_proxy(
        &self,
        handle: &Arc<ServerHandle>,
        name: String,
        description: String,
        input_schema: serde_json::Value,
    ) {
        // Tools are namespaced by server internally (source id), presented
        // unqualified to agents; same-name collisions resolve per registry
        // scope rules.
        let proxy = ExternalProxyTool::new(
            handle.config.id.clone(),
            name,
            description,
            input_schema,
            handle.connection.clone(),
            self.activity.clone(),
        );
        self.registry
            .register(
                Arc::new(proxy),
                ToolSource::External {
                    server_id: handle.config.id.clone(),
                },
                handle.scope.clone(),
            )
            .await;
    }

    /// Stop a server and deregister its tools. Registration survives, so a
    /// later `ensure_started` (keepalive re-entry) can bring it back.
    pub async fn stop(&self, server_id: &str) -> Result<(), MxfError> {
        let handle = self
            .server(server_id)
            .await
            .ok_or_else(|| MxfError::NotFound(format!("server '{}'", server_id)))?;
        self.shutdown_server(&handle).await;
        Ok(())
    }

    async fn shutdown_server(&self, handle: &Arc<ServerHandle>) {
        let mut core = handle.core.lock().await;
        *handle.connection.write().await = None;
        if let Some(running) = core.running.take() {
            if let Err(e) = running.cancel().await {
                warn!(
                    "external: error shutting down server '{}': {}",
                    handle.config.id, e
                );
            }
        }
        core.state = ServerState::Stopped;
        drop(core);
        self.registry.unregister_external(&handle.config.id).await;
        info!("external: server '{}' stopped", handle.config.id);
    }

    /// Used on dispatch into a channel whose keepalive stopped the server: a
    /// stopped-but-registered server is brought back up.
    pub async fn ensure_started(&self, server_id: &str) -> Result<()> {
        let handle = self
            .server(server_id)
            .await
            .context("server not registered")?;
        if handle.state().await == ServerState::Stopped {
            self.start(server_id).await?;
        }
        Ok(())
    }

    async fn server(&self, server_id: &str) -> Option<Arc<ServerHandle>> {
        self.servers.read().await.get(server_id).cloned()
    }

    /// Health probe: a cheap round-trip on the live connection.
    async fn probe(handle: &Arc<ServerHandle>) -> Result<()> {
        let connection = handle.connection.read().await.clone();
        let Some(connection) = connection else {
            anyhow::bail!("no connection");
        };
        match connection {
            Connection::Stdio(peer) => {
                tokio::time::timeout(PROBE_TIMEOUT, peer.list_all_tools())
                    .await
                    .map_err(|_| anyhow::anyhow!("probe timed out"))?
                    .map_err(|e| anyhow::anyhow!("probe failed: {}", e))?;
            }
            Connection::Http(client) => {
                tokio::time::timeout(PROBE_TIMEOUT, client.list_tools())
                    .await
                    .map_err(|_| anyhow::anyhow!("probe timed out"))??;
            }
        }
        Ok(())
    }

    async fn spawn_supervisor(self: &Arc<Self>, server_id: &str) {
        let weak = Arc::downgrade(self);
        let server_id = server_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                let interval = {
                    let Some(manager) = weak.upgrade() else { return };
                    let Some(handle) = manager.server(&server_id).await else {
                        return; // unregistered
                    };
                    Duration::from_secs(handle.config.health_check_interval_secs.max(1))
                };
                tokio::time::sleep(interval).await;

                let Some(manager) = weak.upgrade() else { return };
                manager.supervise_once(&server_id).await;
            }
        });
        self.supervisors.lock().await.push(task);
    }

    /// One supervision pass for a server: health check, crash restart with
    /// backoff, keepalive expiry. Extracted so tests can drive it directly.
    pub async fn supervise_once(&self, server_id: &str) {
        let Some(handle) = self.server(server_id).await else {
            return;
        };
        let state = handle.state().await;

        match state {
            ServerState::Ready => {
                // Keepalive expiry applies only to channel-scoped servers.
                if let (ToolScope::Channel(_), Some(minutes)) =
                    (&handle.scope, handle.config.keep_alive_minutes)
                {
                    let idle = self.activity.idle_for(&handle.config.id);
                    if idle.is_some_and(|d| d >= Duration::from_secs(minutes * 60)) {
                        info!(
                            "external: server '{}' idle past keepalive, stopping",
                            handle.config.id
                        );
                        self.shutdown_server(&handle).await;
                        return;
                    }
                }

                if let Err(e) = Self::probe(&handle).await {
                    let mut core = handle.core.lock().await;
                    core.consecutive_health_failures += 1;
                    let failures = core.consecutive_health_failures;
                    warn!(
                        "external: health probe for '{}' failed ({}/{}): {}",
                        handle.config.id, failures, HEALTH_FAILURE_THRESHOLD, e
                    );
                    if failures >= HEALTH_FAILURE_THRESHOLD {
                        core.state = ServerState::Failed;
                        core.running = None;
                        drop(core);
                        *handle.connection.write().await = None;
                        self.registry.unregister_external(&handle.config.id).await;
                    }
                } else {
                    handle.core.lock().await.consecutive_health_failures = 0;
                }
            }
            ServerState::Failed => {
                let attempts = {
                    let core = handle.core.lock().await;
                    core.restart_attempts
                };
                if !handle.config.restart_on_crash
                    || attempts >= handle.config.max_restart_attempts
                {
                    // Pinned failed until manual unregister.
                    return;
                }
                let delay = restart_backoff(attempts);
                debug!(
                    "external: restarting '{}' (attempt {}) after {:?}",
                    handle.config.id,
                    attempts + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                handle.core.lock().await.restart_attempts = attempts + 1;
                if let Err(e) = self.start(&handle.config.id).await {
                    warn!(
                        "external: restart {} of '{}' failed: {}",
                        attempts + 1,
                        handle.config.id,
                        e
                    );
                }
            }
            ServerState::Starting | ServerState::Stopped => {}
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for id in ids {
            if let Some(handle) = self.server(&id).await {
                self.shutdown_server(&handle).await;
            }
        }
        for task in self.supervisors.lock().await.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests;
