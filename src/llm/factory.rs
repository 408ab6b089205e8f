//! Client construction and caching keyed by (kind, model, endpoint).

use super::anthropic::AnthropicClient;
use super::error::ModelError;
use super::local::{normalize_local_endpoint, LocalClient};
use super::openai::OpenAiClient;
use super::prompts::PromptCatalog;
use super::FullClient;
use crate::types::{LlmProvider, ProviderKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

type CacheKey = (ProviderKind, String, String);

pub struct ClientFactory {
    prompts: Arc<PromptCatalog>,
    cache: Mutex<HashMap<CacheKey, Arc<dyn FullClient>>>,
}

impl ClientFactory {
    pub fn new(prompts: Arc<PromptCatalog>) -> Self {
        Self {
            prompts,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Builds (or reuses) the client for a provider record. Records with
    /// missing credentials are rejected here, before any request runs.
    pub fn create(&self, provider: &LlmProvider) -> Result<Arc<dyn FullClient>, ModelError> {
        let mut provider = provider.clone();
        match provider.kind {
            ProviderKind::OpenAi | ProviderKind::Anthropic => {
                if provider.api_key.trim().is_empty() {
                    return Err(ModelError::MissingApiKey {
                        kind: provider.kind.as_str().to_string(),
                    });
                }
            }
            ProviderKind::Local => {
                if provider.endpoint.trim().is_empty() {
                    return Err(ModelError::MissingEndpoint);
                }
                provider.endpoint = normalize_local_endpoint(&provider.endpoint);
            }
        }

        let key = (
            provider.kind,
            provider.model.clone(),
            provider.endpoint.clone(),
        );
        let mut cache = self.cache.lock().expect("client cache lock");
        if let Some(client) = cache.get(&key) {
            return Ok(Arc::clone(client));
        }

        debug!(kind = provider.kind.as_str(), model = %provider.model, "creating model client");
        let client: Arc<dyn FullClient> = match provider.kind {
            ProviderKind::OpenAi => {
                Arc::new(OpenAiClient::new(provider, Arc::clone(&self.prompts)))
            }
            ProviderKind::Anthropic => {
                Arc::new(AnthropicClient::new(provider, Arc::clone(&self.prompts)))
            }
            ProviderKind::Local => Arc::new(LocalClient::new(provider, Arc::clone(&self.prompts))),
        };
        cache.insert(key, Arc::clone(&client));
        Ok(client)
    }
}
