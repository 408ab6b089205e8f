//! Persistent connection for sse/http tool providers: the same JSON-RPC
//! dialect as stdio, carried over HTTP POST against the provider URL.

use super::error::RegistryError;
use super::process::{parse_tool_listing, PROTOCOL_VERSION};
use super::McpConnection;
use crate::types::ToolDescriptor;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpConnection {
    name: String,
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    tools: AsyncMutex<Vec<ToolDescriptor>>,
}

impl HttpConnection {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            http,
            next_id: AtomicU64::new(1),
            tools: AsyncMutex::new(Vec::new()),
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.transport_error(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_error(format!("HTTP status {}", status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| RegistryError::Protocol {
                name: self.name.clone(),
                message: format!("invalid JSON-RPC response: {err}"),
            })?;

        if let Some(error) = body.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(RegistryError::Rpc {
                name: self.name.clone(),
                code,
                message,
            });
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), RegistryError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.http
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.transport_error(err.to_string()))?;
        Ok(())
    }

    fn transport_error(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::Transport {
            name: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl McpConnection for HttpConnection {
    async fn start(&self) -> Result<(), RegistryError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": true },
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.send_request("initialize", params).await?;
        self.send_notification("notifications/initialized", json!({}))
            .await?;

        let listing = self.send_request("tools/list", json!({})).await?;
        let tools = parse_tool_listing(&self.name, &listing)?;
        *self.tools.lock().await = tools;
        Ok(())
    }

    async fn stop(&self) {}

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RegistryError> {
        let params = json!({
            "name": name,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.send_request("tools/call", params).await
    }

    async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().await.clone()
    }
}
