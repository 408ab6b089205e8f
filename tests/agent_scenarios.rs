//! End-to-end scenarios across the registry, processor and facade,
//! driven by a scripted backend seam.

use async_trait::async_trait;
use opsrelay::llm::{run_tool_loop, ChatCompleter};
use opsrelay::{
    ApprovalDecision, ConversationMessage, ConversationSession, DisplaySink, LlmManager,
    LlmProvider, ModelError, PromptCatalog, ProviderKind, ProviderStatus, Role, Storage,
    ToolCall, ToolCaller, ToolDefinition, ToolProvider, ToolRegistry, Transport,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

struct ScriptedBackend {
    turns: Mutex<Vec<ConversationMessage>>,
}

impl ScriptedBackend {
    fn new(turns: Vec<ConversationMessage>) -> Self {
        Self {
            turns: Mutex::new(turns),
        }
    }
}

#[async_trait]
impl ChatCompleter for ScriptedBackend {
    async fn complete(
        &self,
        _messages: &[ConversationMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ConversationMessage, ModelError> {
        let mut turns = self.turns.lock().await;
        if turns.is_empty() {
            return Ok(ConversationMessage::text(Role::Assistant, "exhausted"));
        }
        Ok(turns.remove(0))
    }
}

fn session_seed() -> Vec<ConversationMessage> {
    vec![
        ConversationMessage::text(Role::System, "assist"),
        ConversationMessage::text(Role::User, "list /tmp"),
    ]
}

async fn registry_with_mock(name: &str) -> (Arc<ToolRegistry>, String) {
    let registry = Arc::new(ToolRegistry::new(None));
    let added = registry
        .add(ToolProvider::new(name, "mock", Transport::Stdio))
        .await
        .expect("mock provider registers");
    assert_eq!(added.status, ProviderStatus::Available);
    (registry, added.id)
}

/// Builds the registry-backed caller the way the facade does, but
/// against a fixed provider so the test controls the route table.
fn registry_caller(registry: Arc<ToolRegistry>, provider_id: String, prefix: &str) -> ToolCaller {
    let prefix = format!("{prefix}_");
    Arc::new(move |name, args| {
        let registry = Arc::clone(&registry);
        let provider_id = provider_id.clone();
        let tool = name.strip_prefix(&prefix).unwrap_or(&name).to_string();
        Box::pin(async move {
            registry
                .invoke(&provider_id, &tool, args)
                .await
                .map_err(|err| err.to_string())
        })
    })
}

#[tokio::test]
async fn tool_loop_dispatches_through_the_real_registry() {
    let (registry, provider_id) = registry_with_mock("fs").await;
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("hello.txt"), "x").expect("write");

    let backend = ScriptedBackend::new(vec![
        ConversationMessage::assistant_tool_calls(
            "",
            vec![ToolCall::new(
                "c1",
                "fs_list_directory",
                json!({ "path": dir.path().to_string_lossy() }).to_string(),
            )],
        ),
        ConversationMessage::text(Role::Assistant, "one file found"),
    ]);

    let tools = vec![ToolDefinition {
        name: "fs_list_directory".to_string(),
        description: "[fs] List files and directories in a specified path".to_string(),
        parameters: json!({ "type": "object" }),
        provider: "fs".to_string(),
    }];
    let caller = registry_caller(Arc::clone(&registry), provider_id, "fs");
    let catalog = PromptCatalog::new();
    let mut messages = session_seed();

    let answer = run_tool_loop(&backend, &mut messages, &tools, &caller, None, &catalog, "openai")
        .await
        .expect("loop succeeds");

    assert_eq!(answer, "one file found");
    let tool_turn = messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool turn");
    assert!(tool_turn.content.contains("hello.txt"));
    registry.shutdown().await;
}

#[tokio::test]
async fn provider_reported_errors_stay_inside_the_conversation() {
    let (registry, provider_id) = registry_with_mock("fs").await;

    let backend = ScriptedBackend::new(vec![
        ConversationMessage::assistant_tool_calls(
            "",
            vec![ToolCall::new(
                "c1",
                "fs_read_file",
                r#"{"path":"/definitely/not/here"}"#,
            )],
        ),
        ConversationMessage::text(Role::Assistant, "could not read it"),
    ]);

    let tools = vec![ToolDefinition {
        name: "fs_read_file".to_string(),
        description: "[fs] Read contents of a file".to_string(),
        parameters: json!({ "type": "object", "required": ["path"] }),
        provider: "fs".to_string(),
    }];
    let caller = registry_caller(Arc::clone(&registry), provider_id, "fs");
    let catalog = PromptCatalog::new();
    let mut messages = session_seed();

    let answer = run_tool_loop(&backend, &mut messages, &tools, &caller, None, &catalog, "openai")
        .await
        .expect("tool failure is not fatal");

    assert_eq!(answer, "could not read it");
    let tool_turn = messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool turn");
    assert!(tool_turn.content.starts_with("Error:"));
    registry.shutdown().await;
}

struct AbortingSink;

#[async_trait]
impl DisplaySink for AbortingSink {
    async fn approve(&self, _provider: &str, _tool: &str, _args: &Value) -> ApprovalDecision {
        ApprovalDecision::Abort
    }
}

#[tokio::test]
async fn interactive_abort_stops_before_any_dispatch() {
    let (registry, provider_id) = registry_with_mock("fs").await;

    let backend = ScriptedBackend::new(vec![ConversationMessage::assistant_tool_calls(
        "",
        vec![ToolCall::new("c1", "fs_list_directory", r#"{"path":"/tmp"}"#)],
    )]);
    let tools = vec![ToolDefinition {
        name: "fs_list_directory".to_string(),
        description: "[fs] List".to_string(),
        parameters: json!({ "type": "object" }),
        provider: "fs".to_string(),
    }];
    let caller = registry_caller(Arc::clone(&registry), provider_id, "fs");
    let catalog = PromptCatalog::new();
    let sink: Arc<dyn DisplaySink> = Arc::new(AbortingSink);
    let mut messages = session_seed();

    let err = run_tool_loop(
        &backend,
        &mut messages,
        &tools,
        &caller,
        Some(&sink),
        &catalog,
        "openai",
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ModelError::Aborted));
    assert!(messages.iter().all(|m| m.role != Role::Tool));
    registry.shutdown().await;
}

#[tokio::test]
async fn registry_state_survives_a_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::new(Some(dir.path().to_path_buf())).expect("storage");

    let (provider_id, stored) = {
        let registry = ToolRegistry::new(Some(storage.clone()));
        let added = registry
            .add(ToolProvider::new("Desktop Commander", "mock", Transport::Stdio))
            .await
            .expect("add");
        let stored = registry.get(&added.id).await.expect("get");
        registry.shutdown().await;
        (added.id, stored)
    };

    let reloaded = ToolRegistry::new(Some(storage));
    let provider = reloaded.get(&provider_id).await.expect("reload");
    assert_eq!(provider.name, stored.name);
    assert_eq!(provider.launch_spec, stored.launch_spec);
    assert_eq!(provider.transport, stored.transport);
    assert_eq!(provider.tools, stored.tools);
    reloaded.shutdown().await;
}

#[tokio::test]
async fn llm_provider_records_round_trip_with_active_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::new(Some(dir.path().to_path_buf())).expect("storage");

    let id = {
        let manager = LlmManager::new(Some(storage.clone()));
        let mut provider = LlmProvider::new("main", ProviderKind::OpenAi, "gpt-4");
        provider.api_key = "sk-test".to_string();
        let added = manager.add(provider).await.expect("add");
        manager.set_active(&added.id).await.expect("activate");
        added.id
    };

    let manager = LlmManager::new(Some(storage));
    let active = manager.active().await.expect("active after reload");
    assert_eq!(active.id, id);

    let listed = manager.list().await;
    assert_eq!(listed.iter().filter(|p| p.is_active).count(), 1);
}

#[tokio::test]
async fn sessions_serialize_losslessly() {
    let mut session = ConversationSession::new();
    session.interactive = true;
    session.push(Role::System, "assist");
    session.push(Role::User, "list /tmp");
    session.push_tool_call(vec![ToolCall::new(
        "c1",
        "fs_list_directory",
        r#"{"path":"/tmp"}"#,
    )]);
    session.push_tool_result("c1", "fs_list_directory", r#"{"entries":["a","b"]}"#);
    session.push(Role::Assistant, "Files: a, b");

    let encoded = serde_json::to_string_pretty(&session).expect("encode");
    let decoded: ConversationSession = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(session, decoded);
}
