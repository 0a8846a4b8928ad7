use crate::conversation::PairingPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Server / transport
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_inbox_capacity() -> usize {
    256
}

fn default_send_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Long random secret asserted once per session establishment.
    /// Overridable via `MXF_DOMAIN_KEY`; compared in constant time.
    #[serde(default)]
    pub domain_key: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field(
                "domain_key",
                &if self.domain_key.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Agent runtime
// ---------------------------------------------------------------------------

fn default_max_iterations() -> usize {
    10
}

fn default_breaker_threshold() -> usize {
    5
}

fn default_breaker_window() -> usize {
    20
}

fn default_dedup_window() -> usize {
    1
}

fn default_keep_last() -> usize {
    5
}

fn default_compaction_trigger_tokens() -> usize {
    12000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Messages kept verbatim at the tail of the conversation.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    /// Estimated token count that triggers a compaction pass.
    #[serde(default = "default_compaction_trigger_tokens")]
    pub trigger_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_last: default_keep_last(),
            trigger_tokens: default_compaction_trigger_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Identical `(tool, args)` invocations tolerated inside the sliding
    /// window before the loop breaker trips.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: usize,
    #[serde(default = "default_breaker_window")]
    pub breaker_window: usize,
    #[serde(default)]
    pub pairing_policy: PairingPolicy,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Enable the natural-language → tool-call interpreter step.
    #[serde(default)]
    pub interpreter_enabled: bool,
    /// Run the optional planning phase before acting.
    #[serde(default)]
    pub planning_enabled: bool,
    /// Run the optional reflection phase at turn end.
    #[serde(default)]
    pub reflection_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            breaker_threshold: default_breaker_threshold(),
            breaker_window: default_breaker_window(),
            pairing_policy: PairingPolicy::default(),
            dedup_window: default_dedup_window(),
            compaction: CompactionConfig::default(),
            interpreter_enabled: false,
            planning_enabled: false,
            reflection_enabled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// LLM provider
// ---------------------------------------------------------------------------

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_half_open_probes() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

impl Default for ProviderBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

fn default_provider_name() -> String {
    "default".to_string()
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// Chat-completions-compatible endpoint URL.
    #[serde(default)]
    pub endpoint: String,
    /// Overridable via `MXF_PROVIDER_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default)]
    pub breaker: ProviderBreakerConfig,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("endpoint", &self.endpoint)
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("model", &self.model)
            .field("name", &self.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Inference parameter service
// ---------------------------------------------------------------------------

fn default_session_override_hours() -> i64 {
    24
}

fn default_temperature_ceiling() -> f32 {
    2.0
}

fn default_reasoning_ceiling() -> u32 {
    8192
}

fn default_output_ceiling() -> u32 {
    16384
}

/// Tier-specific ceilings applied to agent-suggested parameter overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsConfig {
    #[serde(default = "default_temperature_ceiling")]
    pub temperature_ceiling: f32,
    #[serde(default = "default_reasoning_ceiling")]
    pub reasoning_tokens_ceiling: u32,
    #[serde(default = "default_output_ceiling")]
    pub max_output_tokens_ceiling: u32,
    /// Models agents may request. Unknown requests are substituted with the
    /// first entry (status `modified`) or denied when the list is empty.
    #[serde(default)]
    pub known_models: Vec<String>,
    #[serde(default = "default_session_override_hours")]
    pub session_override_hours: i64,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            temperature_ceiling: default_temperature_ceiling(),
            reasoning_tokens_ceiling: default_reasoning_ceiling(),
            max_output_tokens_ceiling: default_output_ceiling(),
            known_models: Vec::new(),
            session_override_hours: default_session_override_hours(),
        }
    }
}

// ---------------------------------------------------------------------------
// Code execution sandbox
// ---------------------------------------------------------------------------

fn default_sandbox_image() -> String {
    "node:22-alpine".to_string()
}

fn default_exec_timeout_ms() -> u64 {
    5000
}

fn default_max_exec_timeout_ms() -> u64 {
    30000
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_max_concurrent_executions() -> usize {
    4
}

fn default_pool_queue_timeout_ms() -> u64 {
    10000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    #[serde(default = "default_exec_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_exec_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent: usize,
    /// How long a `code_execute` call may wait for a pool slot.
    #[serde(default = "default_pool_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: default_sandbox_image(),
            default_timeout_ms: default_exec_timeout_ms(),
            max_timeout_ms: default_max_exec_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            max_concurrent: default_max_concurrent_executions(),
            queue_timeout_ms: default_pool_queue_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persistent store
// ---------------------------------------------------------------------------

fn default_store_path() -> String {
    "mxf.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channels & agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// When set, only these tool names resolve inside the channel.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub system_llm_enabled: bool,
    /// External MCP servers scoped to this channel.
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub channel_id: String,
    pub key_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    /// Tools exempt from the loop circuit breaker.
    #[serde(default)]
    pub circuit_breaker_exempt_tools: Vec<String>,
    /// Per-agent override of the runtime default.
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// Per-agent model override passed to the parameter service.
    #[serde(default)]
    pub model: Option<String>,
}

// ---------------------------------------------------------------------------
// External MCP servers
// ---------------------------------------------------------------------------

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_startup_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalServerConfig {
    pub id: String,
    pub name: String,
    pub transport: McpTransportKind,
    /// Stdio transport: command + args.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Http transport: endpoint URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Channel-scoped servers stop after this many minutes without agent
    /// activity in the channel. `None` keeps the server alive indefinitely.
    #[serde(default)]
    pub keep_alive_minutes: Option<u64>,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub params: ParamsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub external_servers: Vec<ExternalServerConfig>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.domain_key.is_empty() {
            anyhow::bail!("auth.domain_key must be set (or MXF_DOMAIN_KEY exported)");
        }
        if self.auth.domain_key.len() < 16 {
            anyhow::bail!("auth.domain_key must be at least 16 characters");
        }
        if self.runtime.max_iterations == 0 {
            anyhow::bail!("runtime.max_iterations must be at least 1");
        }
        if self.sandbox.max_timeout_ms < self.sandbox.default_timeout_ms {
            anyhow::bail!("sandbox.max_timeout_ms must be >= sandbox.default_timeout_ms");
        }
        for agent in &self.agents {
            if !self.channels.iter().any(|c| c.id == agent.channel_id) {
                anyhow::bail!(
                    "agent '{}' references unknown channel '{}'",
                    agent.agent_id,
                    agent.channel_id
                );
            }
        }
        for channel in &self.channels {
            for server_id in &channel.mcp_server_ids {
                if !self.external_servers.iter().any(|s| s.id == *server_id) {
                    anyhow::bail!(
                        "channel '{}' references unknown MCP server '{}'",
                        channel.id,
                        server_id
                    );
                }
            }
        }
        Ok(())
    }
}
