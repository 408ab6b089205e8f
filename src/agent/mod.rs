//! Agent facade: aggregates the tool registry, the LLM provider manager
//! and the processor factory into the conversation entry points.
//!
//! Tools from every ready provider are advertised under globally unique
//! names (`<sanitized-provider>_<tool>`) and the invoke callback
//! reverses that mapping back to (provider id, tool name) before
//! dispatching through the registry.

use crate::display::DisplaySink;
use crate::llm::{
    DefaultProcessorFactory, ManagerError, ModelError, LlmManager, ProcessorFactory,
    ToolCaller, ToolDefinition,
};
use crate::registry::{sanitize_name, RegistryError, ToolRegistry};
use crate::types::{ConversationSession, LlmProvider, Role, StreamChunk};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Inter-character delay for the streaming fallback emission.
const STREAM_CHAR_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct Agent {
    registry: Arc<ToolRegistry>,
    llm: Arc<LlmManager>,
    factory: Arc<dyn ProcessorFactory>,
}

impl Agent {
    pub fn new(registry: Arc<ToolRegistry>, llm: Arc<LlmManager>) -> Self {
        Self {
            registry,
            llm,
            factory: Arc::new(DefaultProcessorFactory::default()),
        }
    }

    pub fn with_factory(
        registry: Arc<ToolRegistry>,
        llm: Arc<LlmManager>,
        factory: Arc<dyn ProcessorFactory>,
    ) -> Self {
        Self {
            registry,
            llm,
            factory,
        }
    }

    async fn resolve_provider(&self, id: Option<&str>) -> Result<LlmProvider, AgentError> {
        match id {
            Some(id) if !id.is_empty() => Ok(self.llm.get(id).await?),
            _ => Ok(self.llm.active().await?),
        }
    }

    /// Aggregates the catalogs of every ready provider (or the single
    /// named one) into the globally disambiguated tool list, plus the
    /// callback that routes invocations back through the registry.
    pub async fn prepare_tools(
        &self,
        tool_provider_id: Option<&str>,
    ) -> Result<(Vec<ToolDefinition>, ToolCaller), AgentError> {
        let catalogs: HashMap<String, Vec<crate::types::ToolDescriptor>> = match tool_provider_id {
            Some(id) if !id.is_empty() => {
                let provider = self.registry.get(id).await?;
                let tools = self.registry.catalog(id).await?;
                HashMap::from([(provider.name, tools)])
            }
            _ => self.registry.catalog_all().await,
        };

        let providers_by_name: HashMap<String, String> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|provider| (provider.name.clone(), provider.id))
            .collect();

        let mut definitions = Vec::new();
        let mut routes: HashMap<String, (String, String)> = HashMap::new();
        for (provider_name, tools) in catalogs {
            let Some(provider_id) = providers_by_name.get(&provider_name) else {
                continue;
            };
            let prefix = sanitize_name(&provider_name);
            for tool in tools {
                let global_name = format!("{prefix}_{}", tool.name);
                routes.insert(global_name.clone(), (provider_id.clone(), tool.name.clone()));
                definitions.push(ToolDefinition {
                    name: global_name,
                    description: format!("[{provider_name}] {}", tool.description),
                    parameters: tool.schema,
                    provider: provider_name.clone(),
                });
            }
        }
        debug!(tools = definitions.len(), "prepared aggregated tool catalog");

        let registry = Arc::clone(&self.registry);
        let routes = Arc::new(routes);
        let caller: ToolCaller = Arc::new(move |name, args| {
            let registry = Arc::clone(&registry);
            let routes = Arc::clone(&routes);
            Box::pin(async move {
                let Some((provider_id, tool_name)) = routes.get(&name).cloned() else {
                    return Err(format!("tool {name} not found"));
                };
                registry
                    .invoke(&provider_id, &tool_name, args)
                    .await
                    .map_err(|err| err.to_string())
            })
        });

        Ok((definitions, caller))
    }

    /// One-shot request without a session.
    pub async fn process_request(
        &self,
        message: &str,
        tool_provider_id: Option<&str>,
        llm_provider_id: Option<&str>,
    ) -> Result<String, AgentError> {
        let provider = self.resolve_provider(llm_provider_id).await?;
        let processor = self.factory.create_processor(&provider)?;
        let (tools, caller) = self.prepare_tools(tool_provider_id).await?;
        Ok(processor.process_with_tools(message, &tools, caller).await?)
    }

    /// One-shot request observed (and possibly gated) by a display sink.
    pub async fn process_request_ui(
        &self,
        message: &str,
        tool_provider_id: Option<&str>,
        llm_provider_id: Option<&str>,
        display: Arc<dyn DisplaySink>,
    ) -> Result<String, AgentError> {
        display.progress("Initializing AI agent...").await;
        let provider = self.resolve_provider(llm_provider_id).await?;
        let processor = self.factory.create_processor(&provider)?;
        let (tools, caller) = self.prepare_tools(tool_provider_id).await?;
        display
            .progress(&format!("Loaded {} tools total", tools.len()))
            .await;
        Ok(processor
            .process_with_tools_ui(message, &tools, caller, display)
            .await?)
    }

    /// Appends the user turn, runs the tool-calling conversation and
    /// guarantees the session ends with the assistant answer.
    pub async fn process_conversation(
        &self,
        session: &mut ConversationSession,
        message: &str,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, AgentError> {
        if let Some(sink) = &display {
            sink.progress("Initializing AI agent...").await;
        }
        session.push(Role::User, message);

        let provider_override = session.llm_provider_id.clone();
        let provider = self.resolve_provider(provider_override.as_deref()).await?;
        let processor = self.factory.create_processor(&provider)?;

        let tool_override = session.tool_provider_id.clone();
        let (tools, caller) = self.prepare_tools(tool_override.as_deref()).await?;

        let result = match display {
            Some(sink) => {
                processor
                    .process_conversation_ui(session, &tools, caller, sink)
                    .await?
            }
            None => processor.process_conversation(session, &tools, caller).await?,
        };

        // Loop-hosting clients already appended the assistant turn;
        // everything else needs it added here.
        let already_recorded = session
            .messages
            .last()
            .map(|m| m.role == Role::Assistant && m.tool_calls.is_empty() && m.content == result)
            .unwrap_or(false);
        if !already_recorded {
            session.push(Role::Assistant, result.clone());
        }
        info!(session = %session.id, "conversation turn complete");
        Ok(result)
    }

    /// Streaming variant. The tool loop is synchronous, so the loop runs
    /// to completion and the final text is emitted character by
    /// character, preserving the streaming UX.
    pub async fn process_conversation_streaming(
        &self,
        session: &mut ConversationSession,
        message: &str,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(64);
        let outcome = self.process_conversation(session, message, display).await;

        tokio::spawn(async move {
            match outcome {
                Ok(result) => {
                    for character in result.chars() {
                        if tx.send(StreamChunk::text(character.to_string())).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(STREAM_CHAR_DELAY).await;
                    }
                    let _ = tx.send(StreamChunk::done()).await;
                }
                Err(err) => {
                    let _ = tx.send(StreamChunk::error(err.to_string())).await;
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Processor;
    use crate::types::{ProviderKind, ProviderStatus, ToolCall, ToolProvider, Transport};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    /// Processor that replays scripted turns, invoking the callback for
    /// any turn that carries a tool call before appending it.
    struct ScriptedProcessor {
        script: Mutex<Vec<crate::types::ConversationMessage>>,
        seen_tools: Mutex<Vec<ToolDefinition>>,
    }

    struct ScriptedFactory {
        processor: Arc<ScriptedProcessor>,
    }

    impl ProcessorFactory for ScriptedFactory {
        fn create_processor(
            &self,
            _provider: &LlmProvider,
        ) -> Result<Arc<dyn Processor>, ModelError> {
            Ok(self.processor.clone())
        }
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        async fn process_with_tools(
            &self,
            _message: &str,
            tools: &[ToolDefinition],
            _caller: ToolCaller,
        ) -> Result<String, ModelError> {
            self.seen_tools.lock().await.extend_from_slice(tools);
            Ok("one-shot".to_string())
        }

        async fn process_conversation(
            &self,
            session: &mut ConversationSession,
            tools: &[ToolDefinition],
            caller: ToolCaller,
        ) -> Result<String, ModelError> {
            self.seen_tools.lock().await.extend_from_slice(tools);
            let mut script = self.script.lock().await;
            let mut last_text = String::new();
            while !script.is_empty() {
                let turn = script.remove(0);
                let calls = turn.tool_calls.clone();
                last_text = turn.content.clone();
                session.messages.push(turn);
                for call in calls {
                    let args: serde_json::Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                    let content = match (caller)(call.function.name.clone(), args).await {
                        Ok(value) => value.to_string(),
                        Err(err) => format!("Error: {err}"),
                    };
                    session.push_tool_result(&call.id, &call.function.name, content);
                }
            }
            Ok(last_text)
        }

        async fn process_with_tools_ui(
            &self,
            message: &str,
            tools: &[ToolDefinition],
            caller: ToolCaller,
            _display: Arc<dyn DisplaySink>,
        ) -> Result<String, ModelError> {
            self.process_with_tools(message, tools, caller).await
        }

        async fn process_conversation_ui(
            &self,
            session: &mut ConversationSession,
            tools: &[ToolDefinition],
            caller: ToolCaller,
            _display: Arc<dyn DisplaySink>,
        ) -> Result<String, ModelError> {
            self.process_conversation(session, tools, caller).await
        }

        fn supports_conversation(&self) -> bool {
            true
        }

        fn supports_function_calling(&self) -> bool {
            true
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn client(&self) -> Arc<dyn crate::llm::FullClient> {
            unreachable!("scripted processor has no client")
        }
    }

    async fn agent_with_script(
        script: Vec<crate::types::ConversationMessage>,
    ) -> (Agent, Arc<ScriptedProcessor>, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new(None));
        let llm = Arc::new(LlmManager::new(None));
        let mut provider = LlmProvider::new("cloud", ProviderKind::OpenAi, "gpt-4");
        provider.api_key = "sk-test".to_string();
        let added = llm.add(provider).await.expect("add provider");
        llm.set_active(&added.id).await.expect("activate");

        let processor = Arc::new(ScriptedProcessor {
            script: Mutex::new(script),
            seen_tools: Mutex::new(Vec::new()),
        });
        let factory = Arc::new(ScriptedFactory {
            processor: processor.clone(),
        });
        let agent = Agent::with_factory(Arc::clone(&registry), llm, factory);
        (agent, processor, registry)
    }

    #[tokio::test]
    async fn tools_are_exposed_under_sanitized_global_names() {
        let (agent, _processor, registry) = agent_with_script(Vec::new()).await;
        registry
            .add(ToolProvider::new("Desktop Commander", "mock", Transport::Stdio))
            .await
            .expect("add provider");

        let (tools, _caller) = agent.prepare_tools(None).await.expect("prepare");
        assert!(!tools.is_empty());
        for tool in &tools {
            assert!(tool.name.starts_with("Desktop_Commander_"));
            assert!(tool.description.starts_with("[Desktop Commander]"));
            // The provider keeps its unsanitized display name.
            assert_eq!(tool.provider, "Desktop Commander");
            assert!(tool
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn invoke_callback_reverses_the_global_name() {
        let (agent, _processor, registry) = agent_with_script(Vec::new()).await;
        let added = registry
            .add(ToolProvider::new("fs", "mock", Transport::Stdio))
            .await
            .expect("add provider");
        assert_eq!(added.status, ProviderStatus::Available);

        let (_tools, caller) = agent.prepare_tools(None).await.expect("prepare");
        let dir = tempfile::tempdir().expect("tempdir");
        let result = (caller)(
            "fs_list_directory".to_string(),
            json!({ "path": dir.path().to_string_lossy() }),
        )
        .await
        .expect("invoke");
        assert!(result.get("entries").is_some());

        let err = (caller)("unknown_tool".to_string(), json!({})).await.unwrap_err();
        assert!(err.contains("not found"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn conversation_appends_user_and_assistant_turns() {
        let script = vec![crate::types::ConversationMessage::text(
            Role::Assistant,
            "hi",
        )];
        let (agent, _processor, registry) = agent_with_script(script).await;
        let mut session = ConversationSession::new();
        session.push(Role::System, "be helpful");

        let answer = agent
            .process_conversation(&mut session, "hello", None)
            .await
            .expect("process");

        assert_eq!(answer, "hi");
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(session.messages[1].content, "hello");
        assert_eq!(session.messages[2].content, "hi");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn tool_turns_flow_into_the_session() {
        let script = vec![
            crate::types::ConversationMessage::assistant_tool_calls(
                "",
                vec![ToolCall::new("c1", "fs_list_directory", r#"{"path":"/tmp"}"#)],
            ),
            crate::types::ConversationMessage::text(Role::Assistant, "Files: a, b"),
        ];
        let (agent, _processor, registry) = agent_with_script(script).await;
        registry
            .add(ToolProvider::new("fs", "mock", Transport::Stdio))
            .await
            .expect("add provider");

        let mut session = ConversationSession::new();
        let answer = agent
            .process_conversation(&mut session, "list /tmp", None)
            .await
            .expect("process");

        assert_eq!(answer, "Files: a, b");
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(session.messages[2].tool_call_id.as_deref(), Some("c1"));
        // Final assistant turn is not duplicated by the facade.
        assert_eq!(
            session
                .messages
                .iter()
                .filter(|m| m.role == Role::Assistant && m.content == "Files: a, b")
                .count(),
            1
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn missing_active_provider_surfaces_a_manager_error() {
        let registry = Arc::new(ToolRegistry::new(None));
        let llm = Arc::new(LlmManager::new(None));
        let agent = Agent::new(Arc::clone(&registry), llm);

        let err = agent
            .process_request("hello", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Manager(ManagerError::NoActive)));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn streaming_fallback_emits_characters_then_done() {
        let script = vec![crate::types::ConversationMessage::text(
            Role::Assistant,
            "hey",
        )];
        let (agent, _processor, registry) = agent_with_script(script).await;
        let mut session = ConversationSession::new();

        let mut rx = agent
            .process_conversation_streaming(&mut session, "hello", None)
            .await;

        let mut collected = String::new();
        let mut saw_done = false;
        while let Some(chunk) = rx.recv().await {
            assert!(chunk.error.is_none());
            collected.push_str(&chunk.content);
            if chunk.done {
                saw_done = true;
            }
        }
        assert_eq!(collected, "hey");
        assert!(saw_done);
        registry.shutdown().await;
    }
}
