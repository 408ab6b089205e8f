//! LLM provider manager: storage-backed CRUD with a single-active
//! invariant. Toggling the active record clears the flag on all others
//! under the writer lock before persisting.

use super::local::normalize_local_endpoint;
use crate::storage::Storage;
use crate::types::{LlmProvider, ProviderKind};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("LLM provider '{id}' not found")]
    NotFound { id: String },
    #[error("no active LLM provider configured")]
    NoActive,
    #[error("provider name is required")]
    NameRequired,
    #[error("API key is required for provider kind '{kind}'")]
    ApiKeyRequired { kind: String },
    #[error("endpoint is required for local providers")]
    EndpointRequired,
}

/// Field patch for [`LlmManager::update`]; absent fields keep their
/// current value. The kind is deliberately not patchable since it keys
/// the cached client.
#[derive(Debug, Default, Clone)]
pub struct ProviderUpdate {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub config: Option<serde_json::Map<String, Value>>,
}

pub struct LlmManager {
    providers: RwLock<HashMap<String, LlmProvider>>,
    storage: Option<Storage>,
}

impl LlmManager {
    pub fn new(storage: Option<Storage>) -> Self {
        let providers = match &storage {
            Some(storage) => match storage.load_llm_providers() {
                Ok(providers) => providers,
                Err(err) => {
                    warn!(%err, "failed to load persisted LLM providers");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };
        Self {
            providers: RwLock::new(providers),
            storage,
        }
    }

    pub async fn add(&self, mut provider: LlmProvider) -> Result<LlmProvider, ManagerError> {
        if provider.id.is_empty() {
            provider.id = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        provider.created_at = now;
        provider.updated_at = now;
        validate(&mut provider)?;

        {
            let mut providers = self.providers.write().await;
            providers.insert(provider.id.clone(), provider.clone());
        }
        self.persist().await;
        info!(provider = %provider.name, kind = provider.kind.as_str(), "registered LLM provider");
        Ok(provider)
    }

    pub async fn remove(&self, id: &str) -> Result<(), ManagerError> {
        let removed = self.providers.write().await.remove(id);
        if removed.is_none() {
            return Err(ManagerError::NotFound { id: id.to_string() });
        }
        self.persist().await;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<LlmProvider, ManagerError> {
        self.providers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })
    }

    pub async fn list(&self) -> Vec<LlmProvider> {
        self.providers.read().await.values().cloned().collect()
    }

    pub async fn active(&self) -> Result<LlmProvider, ManagerError> {
        self.providers
            .read()
            .await
            .values()
            .find(|provider| provider.is_active)
            .cloned()
            .ok_or(ManagerError::NoActive)
    }

    /// Atomically makes `id` the only active provider.
    pub async fn set_active(&self, id: &str) -> Result<(), ManagerError> {
        {
            let mut providers = self.providers.write().await;
            if !providers.contains_key(id) {
                return Err(ManagerError::NotFound { id: id.to_string() });
            }
            let now = Utc::now();
            for provider in providers.values_mut() {
                if provider.is_active {
                    provider.is_active = false;
                    provider.updated_at = now;
                }
            }
            if let Some(provider) = providers.get_mut(id) {
                provider.is_active = true;
                provider.updated_at = now;
            }
        }
        self.persist().await;
        Ok(())
    }

    pub async fn update(&self, id: &str, patch: ProviderUpdate) -> Result<LlmProvider, ManagerError> {
        let updated = {
            let mut providers = self.providers.write().await;
            let provider = providers
                .get_mut(id)
                .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })?;

            if let Some(name) = patch.name {
                provider.name = name;
            }
            if let Some(endpoint) = patch.endpoint {
                provider.endpoint = endpoint;
            }
            if let Some(model) = patch.model {
                provider.model = model;
            }
            if let Some(api_key) = patch.api_key {
                provider.api_key = api_key;
            }
            if let Some(config) = patch.config {
                provider.config = config;
            }
            provider.updated_at = Utc::now();
            validate(provider)?;
            provider.clone()
        };
        self.persist().await;
        Ok(updated)
    }

    /// Flushes current state; there are no background tasks to stop.
    pub async fn shutdown(&self) {
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let snapshot = self.providers.read().await.clone();
        if let Err(err) = storage.save_llm_providers(&snapshot) {
            warn!(%err, "failed to persist LLM providers");
        }
    }
}

fn validate(provider: &mut LlmProvider) -> Result<(), ManagerError> {
    if provider.name.trim().is_empty() {
        return Err(ManagerError::NameRequired);
    }
    match provider.kind {
        ProviderKind::OpenAi | ProviderKind::Anthropic => {
            if provider.api_key.trim().is_empty() {
                return Err(ManagerError::ApiKeyRequired {
                    kind: provider.kind.as_str().to_string(),
                });
            }
        }
        ProviderKind::Local => {
            if provider.endpoint.trim().is_empty() {
                return Err(ManagerError::EndpointRequired);
            }
            provider.endpoint = normalize_local_endpoint(&provider.endpoint);
        }
    }
    Ok(())
}
