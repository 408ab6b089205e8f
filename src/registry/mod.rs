//! Tool registry: owns MCP providers, discovers their catalogs and
//! routes tool invocations.
//!
//! stdio providers are probed once at registration and their catalog is
//! cached on the record; real stdio invocations then run against a fresh
//! subprocess per call, so there is no idle connection to health-check.
//! sse/http providers keep a persistent connection instead.

mod error;
mod http;
mod mock;
mod process;

pub use error::RegistryError;
pub use http::HttpConnection;
pub use mock::MockConnection;
pub use process::StdioConnection;

use crate::storage::Storage;
use crate::types::{ProviderStatus, ToolDescriptor, ToolProvider, Transport};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const REMOTE_STALE_SECS: i64 = 60;
const UNKNOWN_STALE_SECS: i64 = 120;

/// One live connection to a tool provider, whatever the transport.
#[async_trait]
pub trait McpConnection: Send + Sync {
    async fn start(&self) -> Result<(), RegistryError>;
    async fn stop(&self);
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RegistryError>;
    async fn tools(&self) -> Vec<ToolDescriptor>;
}

/// Replaces spaces and hyphens with underscores so provider names can be
/// embedded in globally unique tool names.
pub fn sanitize_name(name: &str) -> String {
    name.replace([' ', '-'], "_")
}

fn is_mock_spec(launch_spec: &str) -> bool {
    launch_spec == "echo" || launch_spec == "mock"
}

pub struct ToolRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    providers: RwLock<HashMap<String, ToolProvider>>,
    connections: RwLock<HashMap<String, Arc<dyn McpConnection>>>,
    storage: Option<Storage>,
    cancel: CancellationToken,
}

impl ToolRegistry {
    /// Creates the registry, loading any persisted providers, and starts
    /// the background health sweep.
    pub fn new(storage: Option<Storage>) -> Self {
        let providers = match &storage {
            Some(storage) => match storage.load_tool_providers() {
                Ok(providers) => providers,
                Err(err) => {
                    warn!(%err, "failed to load persisted tool providers");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        let inner = Arc::new(RegistryInner {
            providers: RwLock::new(providers),
            connections: RwLock::new(HashMap::new()),
            storage,
            cancel: CancellationToken::new(),
        });

        let sweeper = Arc::clone(&inner);
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => sweeper.health_sweep().await,
                }
            }
        });

        Self { inner }
    }

    /// Registers a provider and probes it. The provider only becomes
    /// ready after at least one successful tool discovery.
    pub async fn add(&self, mut provider: ToolProvider) -> Result<ToolProvider, RegistryError> {
        if provider.id.is_empty() {
            provider.id = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        provider.status = ProviderStatus::Pending;
        provider.created_at = now;
        provider.updated_at = now;

        let id = provider.id.clone();
        self.inner
            .providers
            .write()
            .await
            .insert(id.clone(), provider.clone());

        match provider.transport {
            Transport::Stdio => self.inner.probe_stdio(&id).await,
            Transport::Sse | Transport::Http => self.inner.connect_remote(&id).await,
            Transport::Unknown => {
                self.inner
                    .set_status(&id, ProviderStatus::Error, false)
                    .await;
            }
        }

        self.inner.persist().await;
        self.get(&id).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let removed = self.inner.providers.write().await.remove(id);
        if removed.is_none() {
            return Err(RegistryError::NotFound { id: id.to_string() });
        }
        if let Some(connection) = self.inner.connections.write().await.remove(id) {
            connection.stop().await;
        }
        self.inner.persist().await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<ToolProvider, RegistryError> {
        self.inner
            .providers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    pub async fn list(&self) -> Vec<ToolProvider> {
        self.inner.providers.read().await.values().cloned().collect()
    }

    /// Cached catalog for one provider.
    pub async fn catalog(&self, id: &str) -> Result<Vec<ToolDescriptor>, RegistryError> {
        let provider = self.get(id).await?;
        if !provider.tools.is_empty() {
            return Ok(provider.tools);
        }
        let connection = self.inner.connections.read().await.get(id).cloned();
        match connection {
            Some(connection) => Ok(connection.tools().await),
            None => Err(RegistryError::NotReady {
                name: provider.name,
            }),
        }
    }

    /// Catalogs of every ready provider, keyed by provider name.
    pub async fn catalog_all(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        let providers = self.inner.providers.read().await;
        let mut all = HashMap::new();
        for provider in providers.values() {
            if provider.status.is_ready() && !provider.tools.is_empty() {
                all.insert(provider.name.clone(), provider.tools.clone());
            }
        }
        all
    }

    /// Invokes one tool. For real stdio providers this spawns a fresh
    /// subprocess and terminates it on return, including error paths.
    pub async fn invoke(
        &self,
        id: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, RegistryError> {
        let (provider, connection) = {
            let providers = self.inner.providers.read().await;
            let provider = providers
                .get(id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
            let connection = self.inner.connections.read().await.get(id).cloned();
            (provider, connection)
        };

        let result = match provider.transport {
            Transport::Stdio if is_mock_spec(&provider.launch_spec) => {
                let connection = connection.ok_or_else(|| RegistryError::NotReady {
                    name: provider.name.clone(),
                })?;
                connection.call_tool(tool, arguments).await
            }
            Transport::Stdio => {
                if !provider.status.is_ready() {
                    return Err(RegistryError::NotReady {
                        name: provider.name,
                    });
                }
                let fresh = StdioConnection::new(
                    provider.name.clone(),
                    &provider.launch_spec,
                    self.inner.cancel.child_token(),
                );
                let outcome = match fresh.start().await {
                    Ok(()) => fresh.call_tool(tool, arguments).await,
                    Err(err) => Err(err),
                };
                fresh.stop().await;
                outcome
            }
            Transport::Sse | Transport::Http => {
                let connection = connection.ok_or_else(|| RegistryError::NotReady {
                    name: provider.name.clone(),
                })?;
                connection.call_tool(tool, arguments).await
            }
            Transport::Unknown => Err(RegistryError::NotReady {
                name: provider.name,
            }),
        };

        if result.is_ok() {
            self.inner.touch_ping(id).await;
        }
        result
    }

    pub async fn shutdown(&self) {
        let connections: Vec<Arc<dyn McpConnection>> = {
            let mut map = self.inner.connections.write().await;
            map.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            connection.stop().await;
        }
        self.inner.cancel.cancel();
        info!("tool registry shut down");
    }
}

impl RegistryInner {
    async fn probe_stdio(self: &Arc<Self>, id: &str) {
        let Some(provider) = self.providers.read().await.get(id).cloned() else {
            return;
        };

        let connection: Arc<dyn McpConnection> = if is_mock_spec(&provider.launch_spec) {
            Arc::new(MockConnection::new(provider.name.clone()))
        } else {
            Arc::new(StdioConnection::new(
                provider.name.clone(),
                &provider.launch_spec,
                self.cancel.child_token(),
            ))
        };

        if let Err(err) = connection.start().await {
            warn!(provider = %provider.name, %err, "stdio probe failed");
            self.set_status(id, ProviderStatus::Error, false).await;
            return;
        }

        let tools = connection.tools().await;
        if tools.is_empty() {
            warn!(provider = %provider.name, "stdio probe returned no tools");
            connection.stop().await;
            self.set_status(id, ProviderStatus::Error, false).await;
            return;
        }

        // The probe is kept alive only for mock providers; real stdio
        // invocations spawn a fresh process per call.
        if is_mock_spec(&provider.launch_spec) {
            self.connections
                .write()
                .await
                .insert(id.to_string(), connection);
        } else {
            connection.stop().await;
        }

        {
            let mut providers = self.providers.write().await;
            if let Some(record) = providers.get_mut(id) {
                record.capabilities = tools.iter().map(|t| t.name.clone()).collect();
                record.tools = tools.clone();
            }
        }
        self.set_status(id, ProviderStatus::Available, true).await;
        info!(provider = %provider.name, tools = tools.len(), "tool provider is now available");
    }

    async fn connect_remote(self: &Arc<Self>, id: &str) {
        let Some(provider) = self.providers.read().await.get(id).cloned() else {
            return;
        };

        let connection = Arc::new(HttpConnection::new(
            provider.name.clone(),
            provider.launch_spec.clone(),
        ));
        if let Err(err) = connection.start().await {
            warn!(provider = %provider.name, %err, "remote handshake failed");
            self.set_status(id, ProviderStatus::Error, false).await;
            return;
        }

        let tools = connection.tools().await;
        {
            let mut providers = self.providers.write().await;
            if let Some(record) = providers.get_mut(id) {
                record.capabilities = tools.iter().map(|t| t.name.clone()).collect();
                record.tools = tools;
            }
        }
        self.connections
            .write()
            .await
            .insert(id.to_string(), connection);
        self.set_status(id, ProviderStatus::Connected, true).await;
        info!(provider = %provider.name, "tool provider connected");
    }

    /// Sets the status, refreshing `last_ping` only for ready
    /// transitions; unhealthy transitions must leave the ping untouched.
    async fn set_status(&self, id: &str, status: ProviderStatus, refresh_ping: bool) {
        let mut providers = self.providers.write().await;
        if let Some(record) = providers.get_mut(id) {
            record.status = status;
            record.updated_at = Utc::now();
            if refresh_ping {
                record.last_ping = Utc::now();
            }
        }
    }

    async fn touch_ping(&self, id: &str) {
        let mut providers = self.providers.write().await;
        if let Some(record) = providers.get_mut(id) {
            record.last_ping = Utc::now();
        }
    }

    async fn health_sweep(&self) {
        let snapshot: Vec<ToolProvider> =
            self.providers.read().await.values().cloned().collect();
        let now = Utc::now();

        for provider in snapshot {
            let stale = match provider.transport {
                // Fresh process per invoke; nothing to probe and idleness
                // never flips a stdio provider to unhealthy.
                Transport::Stdio => continue,
                Transport::Sse | Transport::Http => {
                    (now - provider.last_ping).num_seconds() > REMOTE_STALE_SECS
                }
                Transport::Unknown => {
                    (now - provider.last_ping).num_seconds() > UNKNOWN_STALE_SECS
                }
            };
            if stale && provider.status != ProviderStatus::Unhealthy {
                debug!(provider = %provider.name, "marking provider unhealthy");
                self.set_status(&provider.id, ProviderStatus::Unhealthy, false)
                    .await;
            }
        }
    }

    async fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let snapshot = self.providers.read().await.clone();
        if let Err(err) = storage.save_tool_providers(&snapshot) {
            warn!(%err, "failed to persist tool providers");
        }
    }
}

impl Drop for ToolRegistry {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mock_provider(name: &str) -> ToolProvider {
        ToolProvider::new(name, "mock", Transport::Stdio)
    }

    #[tokio::test]
    async fn mock_provider_becomes_available_with_tools() {
        let registry = ToolRegistry::new(None);
        let added = registry.add(mock_provider("Desktop Commander")).await.expect("add");

        assert_eq!(added.status, ProviderStatus::Available);
        assert!(!added.tools.is_empty());
        assert_eq!(added.capabilities.len(), added.tools.len());

        let catalog = registry.catalog(&added.id).await.expect("catalog");
        assert_eq!(catalog.len(), added.tools.len());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn failing_stdio_probe_marks_error() {
        let registry = ToolRegistry::new(None);
        let added = registry
            .add(ToolProvider::new("broken", "/nonexistent-mcp-server-binary", Transport::Stdio))
            .await
            .expect("add returns the record");

        assert_eq!(added.status, ProviderStatus::Error);
        assert!(registry.catalog(&added.id).await.is_err());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn catalog_all_includes_only_ready_providers() {
        let registry = ToolRegistry::new(None);
        let ok = registry.add(mock_provider("alpha")).await.expect("add");
        registry
            .add(ToolProvider::new("beta", "/nonexistent-bin", Transport::Stdio))
            .await
            .expect("add");

        let all = registry.catalog_all().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("alpha"));
        assert_eq!(ok.status, ProviderStatus::Available);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn invoke_routes_to_mock_and_updates_ping() {
        let registry = ToolRegistry::new(None);
        let added = registry.add(mock_provider("fs")).await.expect("add");
        let before = registry.get(&added.id).await.expect("get").last_ping;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let result = registry
            .invoke(
                &added.id,
                "list_directory",
                json!({ "path": dir.path().to_string_lossy() }),
            )
            .await
            .expect("invoke");
        assert!(result.get("entries").is_some());

        let after = registry.get(&added.id).await.expect("get").last_ping;
        assert!(after > before);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn invoke_unknown_provider_fails() {
        let registry = ToolRegistry::new(None);
        let err = registry.invoke("missing", "tool", Value::Null).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn health_sweep_never_touches_stdio_providers() {
        let registry = ToolRegistry::new(None);
        let added = registry.add(mock_provider("steady")).await.expect("add");

        {
            let mut providers = registry.inner.providers.write().await;
            let record = providers.get_mut(&added.id).expect("record");
            record.last_ping = Utc::now() - chrono::Duration::hours(2);
        }

        registry.inner.health_sweep().await;
        let after = registry.get(&added.id).await.expect("get");
        assert_eq!(after.status, ProviderStatus::Available);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn stale_remote_provider_goes_unhealthy_without_ping_reset() {
        let registry = ToolRegistry::new(None);
        let stale_ping = Utc::now() - chrono::Duration::minutes(5);
        {
            let mut record =
                ToolProvider::new("remote", "http://127.0.0.1:9/rpc", Transport::Http);
            record.id = "r1".to_string();
            record.status = ProviderStatus::Connected;
            record.last_ping = stale_ping;
            registry
                .inner
                .providers
                .write()
                .await
                .insert(record.id.clone(), record);
        }

        registry.inner.health_sweep().await;
        let after = registry.get("r1").await.expect("get");
        assert_eq!(after.status, ProviderStatus::Unhealthy);
        assert_eq!(after.last_ping, stale_ping);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn remove_forgets_the_provider() {
        let registry = ToolRegistry::new(None);
        let added = registry.add(mock_provider("gone")).await.expect("add");
        registry.remove(&added.id).await.expect("remove");
        assert!(registry.get(&added.id).await.is_err());
        assert!(matches!(
            registry.remove(&added.id).await.unwrap_err(),
            RegistryError::NotFound { .. }
        ));
        registry.shutdown().await;
    }

    #[test]
    fn sanitize_replaces_spaces_and_hyphens() {
        assert_eq!(sanitize_name("Desktop Commander"), "Desktop_Commander");
        assert_eq!(sanitize_name("my-server v2"), "my_server_v2");
        let exposed = format!("{}_{}", sanitize_name("a b-c"), "read_file");
        assert!(exposed.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }
}
