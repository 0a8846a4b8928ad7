pub mod pool;

pub use pool::ExecutionPool;

use crate::config::SandboxConfig;
use crate::memory::SqliteStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Patterns rejected by static validation before any code reaches a
/// container. Each entry is `(pattern, message)`.
const BLOCKED_PATTERNS: [(&str, &str); 10] = [
    (r"\beval\s*\(", "eval() is not allowed"),
    (r"\bFunction\s*\(", "dynamic Function() is not allowed"),
    (r"\brequire\s*\(", "require() is not allowed"),
    (r"\bimport\s*\(", "dynamic import() is not allowed"),
    (r"Bun\.spawn", "process spawning is not allowed"),
    (r"child_process", "child_process is not allowed"),
    (
        r#"from\s+['"](?:node:)?(?:fs|net|http|https|dgram|tls|dns)['"]"#,
        "file-system and network imports are not allowed",
    ),
    (r"process\.binding", "process.binding is not allowed"),
    (r"Deno\.", "Deno host APIs are not allowed"),
    (r"WebAssembly\.", "WebAssembly instantiation is not allowed"),
];

const WARNED_PATTERNS: [(&str, &str); 2] = [
    (r"while\s*\(\s*true\s*\)", "unbounded loop; execution will be killed at the timeout"),
    (r"process\.env", "the sandbox environment carries no secrets"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFinding {
    #[serde(rename = "type")]
    pub severity: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeValidation {
    pub safe: bool,
    pub issues: Vec<ValidationFinding>,
}

/// Pattern-based static checks. Any `error` issue blocks execution.
pub fn validate_code(code: &str) -> CodeValidation {
    let mut issues = Vec::new();
    for (pattern, message) in BLOCKED_PATTERNS {
        let re = regex::Regex::new(pattern).expect("static pattern must compile");
        if re.is_match(code) {
            issues.push(ValidationFinding {
                severity: "error".to_string(),
                message: (*message).to_string(),
            });
        }
    }
    for (pattern, message) in WARNED_PATTERNS {
        let re = regex::Regex::new(pattern).expect("static pattern must compile");
        if re.is_match(code) {
            issues.push(ValidationFinding {
                severity: "warning".to_string(),
                message: (*message).to_string(),
            });
        }
    }
    let safe = issues.iter().all(|i| i.severity != "error");
    CodeValidation { safe, issues }
}

/// Deterministic audit key: first 16 hex chars of SHA-256 over the raw bytes.
pub fn code_hash(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Typescript,
}

impl Language {
    fn file_name(self) -> &'static str {
        match self {
            Self::Javascript => "code.mjs",
            Self::Typescript => "code.mts",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub timeout_ms: Option<u64>,
    /// Read-only object exposed as `context` inside the code.
    pub context: Option<Value>,
    pub capture_console: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    /// Configured memory cap, in MB.
    pub memory: u64,
    /// Whether the execution was killed at the timeout.
    pub timeout: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    #[serde(rename = "codeHash")]
    pub code_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "resourceUsage")]
    pub resource_usage: ResourceUsage,
}

const RESULT_SENTINEL: &str = "__MXF_RESULT__";

/// Container-backed code execution with static validation, bounded
/// concurrency, and an immutable audit trail.
///
/// Runs short-lived `docker run` isolates via the CLI (no daemon socket
/// dependency). Docker being unavailable makes the tool report its unmet
/// prerequisite; it never takes the runtime down.
pub struct Sandbox {
    config: SandboxConfig,
    pool: ExecutionPool,
    store: Arc<SqliteStore>,
    docker_binary: String,
    docker_available: OnceCell<bool>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, store: Arc<SqliteStore>) -> Self {
        let pool = ExecutionPool::new(
            config.max_concurrent,
            Duration::from_millis(config.queue_timeout_ms),
        );
        Self {
            config,
            pool,
            store,
            docker_binary: "docker".to_string(),
            docker_available: OnceCell::new(),
        }
    }

    /// Override the container binary (tests point this at a nonexistent
    /// path to exercise the unavailable branch).
    pub fn with_docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker_binary = binary.into();
        self
    }

    pub fn clamp_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.config.default_timeout_ms)
            .clamp(1, self.config.max_timeout_ms)
    }

    async fn docker_available(&self) -> bool {
        *self
            .docker_available
            .get_or_init(|| async {
                let probe = tokio::process::Command::new(&self.docker_binary)
                    .arg("version")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                match probe {
                    Ok(status) if status.success() => true,
                    Ok(_) | Err(_) => false,
                }
            })
            .await
    }

    /// Wrap user code in the capture harness. The code body runs inside an
    /// async arrow function so `return` yields the output; console calls are
    /// recorded; the result crosses the boundary as one sentinel line.
    fn build_harness(request: &ExecutionRequest) -> String {
        let context_json = serde_json::to_string(
            &request
                .context
                .clone()
                .unwrap_or(Value::Object(serde_json::Map::new()))
                .to_string(),
        )
        .unwrap_or_else(|_| "\"{}\"".to_string());

        format!(
            r#"const context = Object.freeze(JSON.parse({context_json}));
const __logs = [];
for (const __level of ["log", "info", "warn", "error", "debug"]) {{
    console[__level] = (...args) => {{
        __logs.push(args.map(a => typeof a === "string" ? a : JSON.stringify(a)).join(" "));
    }};
}}
(async () => {{
    let __output = null;
    let __error = null;
    try {{
        const __value = await (async () => {{
{code}
        }})();
        __output = __value === undefined ? null : __value;
    }} catch (e) {{
        __error = e instanceof Error ? e.message : String(e);
    }}
    process.stdout.write("\n{sentinel}" + JSON.stringify({{ output: __output, error: __error, logs: __logs }}) + "\n");
}})();
"#,
            context_json = context_json,
            code = request.code,
            sentinel = RESULT_SENTINEL,
        )
    }

    fn run_args(&self, language: Language) -> Vec<String> {
        let file = language.file_name();
        let mut node_cmd = "node".to_string();
        if language == Language::Typescript {
            node_cmd.push_str(" --experimental-strip-types");
        }
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--network=none".to_string(),
            format!("--memory={}m", self.config.memory_limit_mb),
            "--cpus=1".to_string(),
            self.config.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > /tmp/{file} && {node_cmd} /tmp/{file}"),
        ]
    }

    /// Execute one request end to end. All failures are data in the outcome;
    /// only the audit write can surface an internal error, and even that is
    /// logged instead of propagated.
    pub async fn execute(
        &self,
        agent_id: &str,
        channel_id: &str,
        request: ExecutionRequest,
    ) -> ExecutionOutcome {
        let hash = code_hash(&request.code);
        let timeout_ms = self.clamp_timeout(request.timeout_ms);
        let mut outcome = self.execute_inner(&request, timeout_ms, &hash).await;
        if !request.capture_console {
            outcome.logs = None;
        }

        if let Err(e) = self.store.record_execution(
            agent_id,
            channel_id,
            &hash,
            match request.language {
                Language::Javascript => "javascript",
                Language::Typescript => "typescript",
            },
            outcome.success,
            outcome.execution_time_ms,
            self.config.memory_limit_mb,
            outcome.resource_usage.timeout,
            outcome.error.as_deref(),
            &Utc::now().to_rfc3339(),
        ) {
            warn!("sandbox: failed to write audit record: {}", e);
        }
        outcome
    }

    async fn execute_inner(
        &self,
        request: &ExecutionRequest,
        timeout_ms: u64,
        hash: &str,
    ) -> ExecutionOutcome {
        let failure = |error: String, timed_out: bool, elapsed_ms: u64| ExecutionOutcome {
            success: false,
            output: Value::Null,
            logs: None,
            execution_time_ms: elapsed_ms,
            code_hash: hash.to_string(),
            error: Some(error),
            resource_usage: ResourceUsage {
                memory: self.config.memory_limit_mb,
                timeout: timed_out,
            },
        };

        if !self.config.enabled {
            return failure("code execution is disabled".to_string(), false, 0);
        }

        let validation = validate_code(&request.code);
        if !validation.safe {
            let messages: Vec<&str> = validation
                .issues
                .iter()
                .filter(|i| i.severity == "error")
                .map(|i| i.message.as_str())
                .collect();
            return failure(
                format!("VALIDATION_ERROR: {}", messages.join("; ")),
                false,
                0,
            );
        }

        if !self.docker_available().await {
            return failure(
                "Docker is required for code execution but is not available".to_string(),
                false,
                0,
            );
        }

        let _permit = match self.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => return failure(e.to_string(), false, 0),
        };

        let harness = Self::build_harness(request);
        let args = self.run_args(request.language);
        debug!("sandbox: running {} bytes of code (hash {})", request.code.len(), hash);

        let started = Instant::now();
        let mut child = match tokio::process::Command::new(&self.docker_binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return failure(format!("failed to start container: {}", e), false, 0),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(harness.as_bytes()).await {
                return failure(
                    format!("failed to write code to container: {}", e),
                    false,
                    started.elapsed().as_millis() as u64,
                );
            }
            drop(stdin);
        }

        let waited =
            tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let output = match waited {
            Err(_) => {
                // kill_on_drop reaps the container process on this path.
                return failure("execution timed out".to_string(), true, elapsed_ms);
            }
            Ok(Err(e)) => return failure(format!("container wait failed: {}", e), false, elapsed_ms),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result_line = stdout
            .lines()
            .rev()
            .find(|line| line.starts_with(RESULT_SENTINEL));
        let Some(result_line) = result_line else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return failure(
                format!(
                    "container produced no result (exit {:?}): {}",
                    output.status.code(),
                    stderr.trim()
                ),
                false,
                elapsed_ms,
            );
        };

        let parsed: Value =
            match serde_json::from_str(&result_line[RESULT_SENTINEL.len()..]) {
                Ok(value) => value,
                Err(e) => return failure(format!("malformed result payload: {}", e), false, elapsed_ms),
            };

        let logs = parsed["logs"].as_array().map(|entries| {
            entries
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        });
        let error = parsed["error"].as_str().map(ToString::to_string);

        ExecutionOutcome {
            success: error.is_none(),
            output: parsed["output"].clone(),
            logs,
            execution_time_ms: elapsed_ms,
            code_hash: hash.to_string(),
            error,
            resource_usage: ResourceUsage {
                memory: self.config.memory_limit_mb,
                timeout: false,
            },
        }
    }
}
