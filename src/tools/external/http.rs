use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const HTTP_TIMEOUT_SECS: u64 = 60;

/// Minimal MCP client speaking JSON-RPC over HTTP POST.
///
/// Covers the three requests the manager needs: `initialize`, `tools/list`,
/// and `tools/call`. Stdio servers go through `rmcp` instead; this client
/// exists for servers reachable only over HTTP.
#[derive(Clone)]
pub struct HttpMcpClient {
    endpoint: String,
    client: reqwest::Client,
    next_id: std::sync::Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct RemoteToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl HttpMcpClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("MCP http request '{}' failed", method))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("MCP http endpoint returned {}", status);
        }

        let parsed: Value = response
            .json()
            .await
            .context("MCP http response was not JSON")?;
        if let Some(error) = parsed.get("error") {
            anyhow::bail!("MCP error for '{}': {}", method, error);
        }
        Ok(parsed["result"].clone())
    }

    pub async fn initialize(&self) -> Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "mxf", "version": crate::VERSION },
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .context("tools/list result missing 'tools' array")?;
        Ok(tools
            .iter()
            .filter_map(|t| {
                Some(RemoteToolInfo {
                    name: t["name"].as_str()?.to_string(),
                    description: t["description"].as_str().unwrap_or("").to_string(),
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                })
            })
            .collect())
    }

    /// Returns `(text content, is_error)`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<(String, bool)> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        let is_error = result["isError"].as_bool().unwrap_or(false);
        let mut output = String::new();
        if let Some(blocks) = result["content"].as_array() {
            for block in blocks {
                if block["type"].as_str() == Some("text") {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(block["text"].as_str().unwrap_or(""));
                }
            }
        }
        Ok((output, is_error))
    }
}

#[cfg(test)]
mod tests;
