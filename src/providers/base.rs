use crate::conversation::{ConversationMessage, ToolCall};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolved inference parameters for one call. Produced by the parameter
/// service (phase profile + override overlay) and consumed opaquely by
/// providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub model: String,
    pub temperature: f32,
    #[serde(rename = "reasoningTokens")]
    pub reasoning_tokens: u32,
    #[serde(rename = "maxOutputTokens")]
    pub max_output_tokens: u32,
}

/// Token accounting reported by the provider for one inference.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One assistant turn returned by a provider.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

impl InferenceResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

/// One inference request. Messages are the already-assembled conversation
/// (system prompt first); the provider performs no history management.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub messages: Vec<ConversationMessage>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub params: InferenceParams,
}

/// Configuration for retry behavior on transient provider errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Capability contract for LLM backends. The runtime never inspects the
/// concrete provider identity except for logging.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> anyhow::Result<InferenceResponse>;

    fn default_model(&self) -> &str;

    /// Human-readable provider name, used only in logs.
    fn name(&self) -> &str {
        "llm"
    }

    /// Infer with exponential backoff and jitter on transient errors.
    /// Non-retryable errors (auth, validation) surface immediately.
    async fn infer_with_retry(
        &self,
        request: InferenceRequest,
        retry: &RetryConfig,
    ) -> anyhow::Result<InferenceResponse> {
        let mut delay_ms = retry.initial_delay_ms;
        let mut last_err = None;

        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                // Full jitter: sleep a uniform fraction of the backoff window.
                let jittered = fastrand::u64(delay_ms / 2..=delay_ms);
                debug!(
                    "{}: retry {}/{} after {}ms",
                    self.name(),
                    attempt,
                    retry.max_retries,
                    jittered
                );
                tokio::time::sleep(Duration::from_millis(jittered)).await;
                delay_ms = ((delay_ms as f64) * retry.backoff_multiplier) as u64;
                delay_ms = delay_ms.min(retry.max_delay_ms);
            }

            match self.infer(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let retryable = e
                        .downcast_ref::<crate::errors::MxfError>()
                        .is_none_or(crate::errors::MxfError::is_retryable);
                    if !retryable {
                        return Err(e);
                    }
                    warn!(
                        "{}: inference attempt {} failed: {}",
                        self.name(),
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("inference failed with no attempts")))
    }
}
