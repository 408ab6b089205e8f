//! opsrelay: a tool-using agent core that mediates between chat LLM
//! backends and MCP tool providers.
//!
//! The crate is organised around three subsystems: the tool registry
//! ([`registry`]), the polymorphic LLM clients with their processors
//! ([`llm`]), and the agent facade ([`agent`]) that wires them together
//! around a conversation session.

pub mod agent;
pub mod display;
pub mod llm;
pub mod registry;
pub mod storage;
pub mod types;

pub use agent::{Agent, AgentError};
pub use display::{ApprovalDecision, DisplaySink, ExecutionSummary, HeadlessSink, NoopSink, TimingSink};
pub use llm::{
    DefaultProcessorFactory, LlmManager, ManagerError, ModelError, Processor, ProcessorFactory,
    PromptCatalog, ToolCaller, ToolDefinition, MAX_TOOL_ITERATIONS,
};
pub use registry::{sanitize_name, McpConnection, RegistryError, ToolRegistry};
pub use storage::{Storage, StorageError};
pub use types::{
    ConversationMessage, ConversationSession, LlmProvider, ProviderKind, ProviderStatus, Role,
    StreamChunk, ToolCall, ToolDescriptor, ToolProvider, Transport,
};
