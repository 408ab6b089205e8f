//! LLM client abstraction: a base capability plus optional tool,
//! conversation and streaming capabilities, negotiated through flags
//! rather than downcasts.

mod anthropic;
mod error;
mod factory;
mod http;
mod local;
mod manager;
mod openai;
mod processor;
pub mod prompts;
mod streaming;
mod tooling;

pub use anthropic::AnthropicClient;
pub use error::ModelError;
pub use factory::ClientFactory;
pub use local::LocalClient;
pub use manager::{LlmManager, ManagerError};
pub use openai::OpenAiClient;
pub use processor::{BackendProcessor, DefaultProcessorFactory, Processor, ProcessorFactory};
pub use prompts::PromptCatalog;
pub use tooling::{run_tool_loop, ChatCompleter, ToolDispatcher};

use crate::display::DisplaySink;
use crate::types::{ConversationSession, ProviderKind, StreamChunk};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const CLOUD_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const LOCAL_TIMEOUT: Duration = Duration::from_secs(120);
/// Hard cap on tool-calling loop iterations, all backends.
pub const MAX_TOOL_ITERATIONS: usize = 10;
pub(crate) const MAX_CONVERSATION_TURNS: u32 = 50;
pub(crate) const LOCAL_MAX_CONVERSATION_TURNS: u32 = 20;
/// Local conversation replay keeps this many trailing messages.
pub(crate) const LOCAL_CONTEXT_WINDOW: usize = 8;
/// Local conversation replay truncates each message to this length.
pub(crate) const LOCAL_CONTENT_TRUNCATE: usize = 1000;

/// Async callback that executes one tool call; errors come back as the
/// text that is embedded into the conversation.
pub type ToolCaller =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// One tool as offered to a backend, already carrying its globally
/// unique name and the display name of the provider it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub model: String,
    pub endpoint: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub tools: bool,
    pub conversation: bool,
    pub streaming: bool,
    pub max_tokens: u32,
    pub max_conversation_turns: u32,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn process_message(&self, message: &str) -> Result<String, ModelError>;

    fn provider_info(&self) -> ProviderInfo;

    fn healthy(&self) -> bool;
}

#[async_trait]
pub trait ToolSupport: Send + Sync {
    /// Runs the message through the backend with tools on offer; hosts
    /// the tool-calling loop for backends that support one.
    async fn process_with_tools(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError>;

    /// Whether the backend speaks a native function-calling dialect.
    fn supports_function_calling(&self) -> bool;
}

#[async_trait]
pub trait ConversationSupport: Send + Sync {
    async fn process_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<String, ModelError>;

    /// Tool-capable conversation processing. Loop-hosting clients append
    /// every intermediate turn (and the final assistant turn) to the
    /// session; prompt-augmenting clients leave the session untouched.
    async fn process_conversation_with_tools(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError>;

    fn supports_conversation(&self) -> bool;
}

#[async_trait]
pub trait StreamingSupport: Send + Sync {
    async fn stream_message(
        &self,
        message: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError>;

    async fn stream_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError>;

    fn supports_streaming(&self) -> bool;
}

/// The full client surface; every backend implements everything and
/// advertises what it actually supports through the capability flags.
pub trait FullClient:
    LlmClient + ToolSupport + ConversationSupport + StreamingSupport
{
    fn capabilities(&self) -> ClientCapabilities;
}
