//! stdio MCP connection: one subprocess speaking line-delimited JSON-RPC.
//!
//! A background reader demultiplexes responses to waiting callers by
//! request id; stderr is drained separately with known-benign startup
//! noise suppressed.

use super::error::RegistryError;
use super::McpConnection;
use crate::types::ToolDescriptor;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(super) const PROTOCOL_VERSION: &str = "2024-11-05";
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup chatter that well-known servers write to stderr; anything
/// else is surfaced as a warning.
const STDERR_NOISE: &[&str] = &[
    "Loading server",
    "Setting up request handlers",
    "initialized",
    "Loading configuration",
    "Configuration loaded",
    "Connecting server",
    "Server connected",
    "Generating tools list",
];

pub struct StdioConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    name: String,
    argv: Vec<String>,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, RegistryError>>>>,
    next_id: AtomicU64,
    tools: AsyncMutex<Vec<ToolDescriptor>>,
    cancel: CancellationToken,
}

impl StdioConnection {
    pub fn new(name: impl Into<String>, launch_spec: &str, cancel: CancellationToken) -> Self {
        let argv = launch_spec
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Self {
            inner: Arc::new(ConnectionInner {
                name: name.into(),
                argv,
                child: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                tools: AsyncMutex::new(Vec::new()),
                cancel,
            }),
        }
    }
}

#[async_trait]
impl McpConnection for StdioConnection {
    async fn start(&self) -> Result<(), RegistryError> {
        self.inner.spawn_process().await?;
        match self.inner.handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.teardown().await;
                Err(err)
            }
        }
    }

    async fn stop(&self) {
        self.inner.teardown().await;
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RegistryError> {
        let params = json!({
            "name": name,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.inner.send_request("tools/call", params).await
    }

    async fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.tools.lock().await.clone()
    }
}

impl ConnectionInner {
    async fn spawn_process(self: &Arc<Self>) -> Result<(), RegistryError> {
        let program = self
            .argv
            .first()
            .ok_or_else(|| RegistryError::Transport {
                name: self.name.clone(),
                message: format!("invalid launch spec: '{}'", self.argv.join(" ")),
            })?;

        let mut command = Command::new(program);
        command
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| RegistryError::Spawn {
            name: self.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.transport_error("failed to capture stderr"))?;

        *self.writer.lock().await = Some(BufWriter::new(stdin));
        *self.child.lock().await = Some(child);

        let reader = Arc::clone(self);
        tokio::spawn(async move { reader.stdout_loop(stdout).await });
        let drainer = Arc::clone(self);
        tokio::spawn(async move { drainer.stderr_loop(stderr).await });

        Ok(())
    }

    async fn handshake(self: &Arc<Self>) -> Result<(), RegistryError> {
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

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(RegistryError::Cancelled { name: self.name.clone() })
            }
            outcome = tokio::time::timeout(RPC_TIMEOUT, rx) => match outcome {
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    Err(RegistryError::Timeout { name: self.name.clone() })
                }
                Ok(Err(_)) => Err(self.transport_error("provider closed before responding")),
                Ok(Ok(result)) => result,
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), RegistryError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&payload).await
    }

    async fn write_line(&self, message: &Value) -> Result<(), RegistryError> {
        let encoded = serde_json::to_string(message).map_err(|source| RegistryError::Protocol {
            name: self.name.clone(),
            message: format!("failed to encode request: {source}"),
        })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("writer not initialised"))?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))
    }

    async fn stdout_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(raw)) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => self.route_message(value).await,
                        Err(source) => {
                            warn!(provider = %self.name, line = trimmed, %source, "invalid JSON from tool provider");
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.fail_all_pending().await;
    }

    async fn route_message(&self, value: Value) {
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            // Notifications carry no id and are ignored.
            if let Some(method) = value.get("method").and_then(Value::as_str) {
                debug!(provider = %self.name, method, "ignoring notification from tool provider");
            }
            return;
        };

        let sender = self.pending.lock().await.remove(&id);
        let Some(sender) = sender else {
            debug!(provider = %self.name, id, "response for unknown request id");
            return;
        };

        let outcome = if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(RegistryError::Rpc {
                name: self.name.clone(),
                code,
                message,
            })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(outcome);
    }

    async fn stderr_loop(self: Arc<Self>, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() || STDERR_NOISE.iter().any(|noise| line.contains(noise)) {
                continue;
            }
            warn!(provider = %self.name, line, "tool provider stderr");
        }
    }

    async fn teardown(&self) {
        *self.writer.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(provider = %self.name, %err, "kill failed (process may have exited)");
            }
            let _ = child.wait().await;
        }
        self.fail_all_pending().await;
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(RegistryError::Transport {
                name: self.name.clone(),
                message: "provider terminated".to_string(),
            }));
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::Transport {
            name: self.name.clone(),
            message: message.into(),
        }
    }
}

/// Parses a `tools/list` result; an empty or missing listing is a
/// protocol error so the provider never reaches a ready state.
pub(super) fn parse_tool_listing(
    provider: &str,
    result: &Value,
) -> Result<Vec<ToolDescriptor>, RegistryError> {
    let entries = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| RegistryError::Protocol {
            name: provider.to_string(),
            message: "tools/list response missing 'tools' array".to_string(),
        })?;

    let mut tools = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        tools.push(ToolDescriptor {
            name: name.to_string(),
            description: entry
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            schema: entry.get("inputSchema").cloned().unwrap_or(Value::Null),
        });
    }

    if tools.is_empty() {
        return Err(RegistryError::Protocol {
            name: provider.to_string(),
            message: "tool catalog is empty".to_string(),
        });
    }
    Ok(tools)
}
