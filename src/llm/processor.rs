//! Processor: the strategy layer binding a client to the prompt catalog.
//! Every operation performs tool-context enhancement and falls back to
//! plain message processing when the client lacks a capability.

use super::error::ModelError;
use super::factory::ClientFactory;
use super::prompts::{enhance_message_with_tools, PromptCatalog};
use super::{FullClient, ToolCaller, ToolDefinition};
use crate::display::DisplaySink;
use crate::types::{ConversationSession, LlmProvider, ProviderKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process_with_tools(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
    ) -> Result<String, ModelError>;

    async fn process_conversation(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
    ) -> Result<String, ModelError>;

    async fn process_with_tools_ui(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Arc<dyn DisplaySink>,
    ) -> Result<String, ModelError>;

    async fn process_conversation_ui(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Arc<dyn DisplaySink>,
    ) -> Result<String, ModelError>;

    fn supports_conversation(&self) -> bool;

    fn supports_function_calling(&self) -> bool;

    fn kind(&self) -> ProviderKind;

    fn client(&self) -> Arc<dyn FullClient>;
}

pub struct BackendProcessor {
    provider: LlmProvider,
    client: Arc<dyn FullClient>,
}

impl BackendProcessor {
    pub fn new(provider: LlmProvider, client: Arc<dyn FullClient>) -> Self {
        Self { provider, client }
    }

    async fn run_with_tools(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        let enhanced = enhance_message_with_tools(message, tools.len());
        let kind = self.provider.kind.as_str();

        if tools.is_empty() {
            if let Some(sink) = &display {
                sink.progress(&format!("Processing with {kind} (no tools available)..."))
                    .await;
            }
            return self.client.process_message(&enhanced).await;
        }

        if let Some(sink) = &display {
            sink.progress(&format!("Processing with {kind} and available tools..."))
                .await;
        }
        let result = self
            .client
            .process_with_tools(&enhanced, tools, caller, display.clone())
            .await;
        if let (Err(err), Some(sink)) = (&result, &display) {
            sink.error(&err.to_string()).await;
        }
        result
    }

    async fn run_conversation(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        let kind = self.provider.kind.as_str();

        if tools.is_empty() {
            if let Some(sink) = &display {
                sink.progress(&format!("Processing conversation with {kind}..."))
                    .await;
            }
            if self.client.supports_conversation() {
                return self.client.process_conversation(session).await;
            }
            let last = session.last_user_message().unwrap_or_default().to_string();
            return self.client.process_message(&last).await;
        }

        if let Some(sink) = &display {
            sink.progress(&format!(
                "Processing conversation with {kind} and available tools..."
            ))
            .await;
        }

        if self.client.supports_conversation() {
            let result = self
                .client
                .process_conversation_with_tools(session, tools, caller, display.clone())
                .await;
            if let (Err(err), Some(sink)) = (&result, &display) {
                sink.error(&err.to_string()).await;
            }
            return result;
        }

        debug!(kind, "client lacks conversation support, replaying last user turn");
        let last = session.last_user_message().unwrap_or_default().to_string();
        self.run_with_tools(&last, tools, caller, display).await
    }
}

#[async_trait]
impl Processor for BackendProcessor {
    async fn process_with_tools(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
    ) -> Result<String, ModelError> {
        self.run_with_tools(message, tools, caller, None).await
    }

    async fn process_conversation(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
    ) -> Result<String, ModelError> {
        self.run_conversation(session, tools, caller, None).await
    }

    async fn process_with_tools_ui(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Arc<dyn DisplaySink>,
    ) -> Result<String, ModelError> {
        self.run_with_tools(message, tools, caller, Some(display)).await
    }

    async fn process_conversation_ui(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Arc<dyn DisplaySink>,
    ) -> Result<String, ModelError> {
        self.run_conversation(session, tools, caller, Some(display)).await
    }

    fn supports_conversation(&self) -> bool {
        self.client.supports_conversation()
    }

    fn supports_function_calling(&self) -> bool {
        self.client.supports_function_calling()
    }

    fn kind(&self) -> ProviderKind {
        self.provider.kind
    }

    fn client(&self) -> Arc<dyn FullClient> {
        Arc::clone(&self.client)
    }
}

/// Creates processors for provider records; the seam the agent facade
/// depends on.
pub trait ProcessorFactory: Send + Sync {
    fn create_processor(&self, provider: &LlmProvider) -> Result<Arc<dyn Processor>, ModelError>;
}

/// Builds processors over cached clients, one per provider activation.
pub struct DefaultProcessorFactory {
    clients: ClientFactory,
}

impl DefaultProcessorFactory {
    pub fn new(prompts: Arc<PromptCatalog>) -> Self {
        Self {
            clients: ClientFactory::new(prompts),
        }
    }
}

impl ProcessorFactory for DefaultProcessorFactory {
    fn create_processor(&self, provider: &LlmProvider) -> Result<Arc<dyn Processor>, ModelError> {
        let client = self.clients.create(provider)?;
        Ok(Arc::new(BackendProcessor::new(provider.clone(), client)))
    }
}

impl Default for DefaultProcessorFactory {
    fn default() -> Self {
        Self::new(Arc::new(PromptCatalog::new()))
    }
}
