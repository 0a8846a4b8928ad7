use crate::conversation::Role;
use crate::errors::MxfError;
use crate::providers::base::{
    InferenceParams, InferenceRequest, InferenceResponse, LlmProvider, TokenUsage,
};
use crate::tools::convert::parse_tool_call_value;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Generic adapter for chat-completions-shaped HTTP endpoints.
///
/// MXF does not reimplement vendor APIs; any backend speaking the common
/// `/chat/completions` dialect (or a proxy translating to it) plugs in here.
/// Tool-call shapes in the response body are normalized through the registry's
/// conversion layer, so assistant outputs from different upstream vendors all
/// reduce to canonical `{toolCallId, name, arguments}`.
pub struct HttpProvider {
    api_key: String,
    default_model: String,
    endpoint: String,
    provider_name: String,
    client: Client,
}

impl HttpProvider {
    pub fn new(
        endpoint: String,
        api_key: String,
        default_model: String,
        provider_name: String,
    ) -> Self {
        Self {
            api_key,
            default_model,
            endpoint,
            provider_name,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_body(request: &InferenceRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut m = json!({
                    "role": role,
                    "content": msg.content,
                });
                if !msg.tool_calls.is_empty() {
                    m["tool_calls"] = json!(
                        msg.tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.tool_call_id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect::<Vec<_>>()
                    );
                }
                if let Some(id) = &msg.tool_call_id {
                    m["tool_call_id"] = json!(id);
                }
                m
            })
            .collect();

        let InferenceParams {
            model,
            temperature,
            reasoning_tokens,
            max_output_tokens,
        } = &request.params;

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_output_tokens,
        });
        if *reasoning_tokens > 0 {
            body["reasoning"] = json!({ "max_tokens": reasoning_tokens });
        }
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = json!(
                    tools
                        .iter()
                        .map(|t| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": t.name,
                                    "description": t.description,
                                    "parameters": t.parameters,
                                }
                            })
                        })
                        .collect::<Vec<_>>()
                );
            }
        }
        body
    }

    fn parse_response(body: &Value) -> Result<InferenceResponse> {
        let choice = body["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("no choices in provider response")?;

        let message = &choice["message"];
        let content = message["content"].as_str().map(ToString::to_string);
        let finish_reason = choice["finish_reason"].as_str().map(ToString::to_string);

        let mut tool_calls = Vec::new();
        if let Some(raw_calls) = message["tool_calls"].as_array() {
            for raw in raw_calls {
                if let Some(call) = parse_tool_call_value(raw) {
                    tool_calls.push(call);
                }
            }
        }

        let usage = TokenUsage {
            input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        Ok(InferenceResponse {
            content,
            tool_calls,
            usage,
            finish_reason,
        })
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let body = Self::build_body(&request);
        debug!(
            "{}: inference call (model={}, messages={})",
            self.provider_name,
            request.params.model,
            request.messages.len()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MxfError::Connection(format!("{}: {}", self.provider_name, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MxfError::Connection(format!("{}: {}", self.provider_name, e)))?;

        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(MxfError::Provider {
                message: format!("{} returned {}: {}", self.provider_name, status, text),
                retryable,
            }
            .into());
        }

        let parsed: Value = serde_json::from_str(&text)
            .with_context(|| format!("{}: malformed response body", self.provider_name))?;
        Self::parse_response(&parsed)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}
