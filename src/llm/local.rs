//! Local model client. Speaks two dialects: the Ollama NDJSON chat API
//! and the generic OpenAI-compatible shape, picked by endpoint. Since
//! most local models lack native function calling, tools are offered
//! through a textual contract and replies are scanned for
//! `{"use_tool": ...}` payloads.

use super::error::ModelError;
use super::http::HttpTransport;
use super::prompts::{local_tool_contract, PromptCatalog};
use super::streaming::{pump_response, NdjsonParser};
use super::{
    ClientCapabilities, ConversationSupport, FullClient, LlmClient, ProviderInfo,
    StreamingSupport, ToolCaller, ToolDefinition, ToolSupport, LOCAL_CONTENT_TRUNCATE,
    LOCAL_CONTEXT_WINDOW, LOCAL_MAX_CONVERSATION_TURNS, LOCAL_TIMEOUT, MAX_TOOL_ITERATIONS,
};
use crate::display::{ApprovalDecision, DisplaySink};
use crate::types::{ConversationSession, LlmProvider, Role, StreamChunk};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const OLLAMA_PORT_PATTERN: &str = ":11434";
const OLLAMA_NAME_PATTERN: &str = "ollama";
const OLLAMA_CHAT_PATH: &str = "/api/chat";
const TOOL_USE_PREFIX: &str = "{\"use_tool\"";

pub struct LocalClient {
    provider: LlmProvider,
    http: HttpTransport,
    prompts: Arc<PromptCatalog>,
}

impl LocalClient {
    pub fn new(provider: LlmProvider, prompts: Arc<PromptCatalog>) -> Self {
        Self {
            http: HttpTransport::new(provider.kind.as_str(), LOCAL_TIMEOUT),
            provider,
            prompts,
        }
    }

    fn require_endpoint(&self) -> Result<&str, ModelError> {
        let endpoint = self.provider.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ModelError::MissingEndpoint);
        }
        Ok(endpoint)
    }

    fn is_ollama(&self) -> bool {
        is_ollama_endpoint(&self.provider.endpoint)
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        let key = self.provider.api_key.trim();
        if key.is_empty() {
            Vec::new()
        } else {
            vec![("Authorization", format!("Bearer {key}"))]
        }
    }

    async fn execute(&self, messages: &[SimpleMessage]) -> Result<String, ModelError> {
        let endpoint = self.require_endpoint()?;
        let is_ollama = self.is_ollama();
        debug!(endpoint, is_ollama, messages = messages.len(), "sending local chat request");

        let headers = self.auth_headers();
        let header_refs: Vec<(&str, &str)> =
            headers.iter().map(|(n, v)| (*n, v.as_str())).collect();

        let response = if is_ollama {
            let body = OllamaRequest {
                model: &self.provider.model,
                messages,
                stream: false,
            };
            self.http.post_json(endpoint, &header_refs, &body).await?
        } else {
            let body = CompatRequest {
                model: &self.provider.model,
                messages,
            };
            self.http.post_json(endpoint, &header_refs, &body).await?
        };

        let text = response
            .text()
            .await
            .map_err(|source| ModelError::network(self.provider.kind.as_str(), source))?;
        parse_local_body(&text, is_ollama)
            .ok_or_else(|| {
                ModelError::invalid_response(
                    self.provider.kind.as_str(),
                    format!("unable to parse response body as any known format: {text}"),
                )
            })
    }

    /// Keeps only the trailing window of non-system messages and
    /// truncates each to keep local context small.
    fn replay_window(&self, session: &ConversationSession) -> Vec<SimpleMessage> {
        let recent: Vec<&crate::types::ConversationMessage> = session
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let start = recent.len().saturating_sub(LOCAL_CONTEXT_WINDOW);
        recent[start..]
            .iter()
            .map(|m| SimpleMessage {
                role: m.role.as_str().to_string(),
                content: truncate_chars(&m.content, LOCAL_CONTENT_TRUNCATE),
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for LocalClient {
    async fn process_message(&self, message: &str) -> Result<String, ModelError> {
        let messages = vec![SimpleMessage {
            role: "user".to_string(),
            content: message.to_string(),
        }];
        self.execute(&messages).await
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: self.provider.kind,
            model: self.provider.model.clone(),
            endpoint: self.provider.endpoint.clone(),
            version: "local".to_string(),
        }
    }

    fn healthy(&self) -> bool {
        !self.provider.endpoint.trim().is_empty()
    }
}

#[async_trait]
impl ToolSupport for LocalClient {
    async fn process_with_tools(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        self.require_endpoint()?;

        let opening = if tools.is_empty() {
            message.to_string()
        } else {
            format!("{}\n\n{message}", local_tool_contract(tools))
        };
        let mut messages = vec![SimpleMessage {
            role: "user".to_string(),
            content: opening,
        }];
        let mut approve_all = false;

        for _ in 0..MAX_TOOL_ITERATIONS {
            let content = self.execute(&messages).await?;
            messages.push(SimpleMessage {
                role: "assistant".to_string(),
                content: content.clone(),
            });

            let Some(request) = (!tools.is_empty())
                .then(|| parse_tool_call(&content))
                .flatten()
            else {
                return Ok(content);
            };

            let Some(offered_tool) = tools.iter().find(|tool| tool.name == request.tool) else {
                warn!(tool = %request.tool, "local model requested unknown tool");
                let offered: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
                messages.push(SimpleMessage {
                    role: "user".to_string(),
                    content: format!(
                        "ERROR: Tool '{}' not found. Available tools: {}. \
                         Please use EXACT tool names from the list.",
                        request.tool,
                        offered.join(", ")
                    ),
                });
                continue;
            };
            let provider = offered_tool.provider.as_str();

            if let Some(sink) = &display {
                sink.tool_call(provider, &request.tool, &request.parameters).await;
                if !approve_all {
                    match sink.approve(provider, &request.tool, &request.parameters).await {
                        ApprovalDecision::Approve => {}
                        ApprovalDecision::ApproveAll => approve_all = true,
                        ApprovalDecision::Deny => {
                            messages.push(SimpleMessage {
                                role: "user".to_string(),
                                content: "Tool execution skipped by user".to_string(),
                            });
                            continue;
                        }
                        ApprovalDecision::Abort => {
                            sink.error("tool execution aborted by user").await;
                            return Err(ModelError::Aborted);
                        }
                    }
                }
            }

            let started = std::time::Instant::now();
            match (caller)(request.tool.clone(), request.parameters.clone()).await {
                Ok(value) => {
                    if let Some(sink) = &display {
                        sink.tool_result(&value, started.elapsed()).await;
                    }
                    let rendered = match &value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    messages.push(SimpleMessage {
                        role: "user".to_string(),
                        content: format!(
                            "Tool '{}' result: {rendered}\n\nPlease provide a final response \
                             based on this information.",
                            request.tool
                        ),
                    });
                }
                Err(error) => {
                    if let Some(sink) = &display {
                        sink.error(&error).await;
                    }
                    let hint = self
                        .prompts
                        .error_hint("local", PromptCatalog::classify_error(&error));
                    let offered: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
                    messages.push(SimpleMessage {
                        role: "user".to_string(),
                        content: format!(
                            "Tool execution failed: {error}. Hint: {hint} Available tools: {}. \
                             Please use correct tool names and try again.",
                            offered.join(", ")
                        ),
                    });
                }
            }
        }

        Err(ModelError::MaxIterations {
            limit: MAX_TOOL_ITERATIONS,
        })
    }

    /// Function calling works through the textual contract above.
    fn supports_function_calling(&self) -> bool {
        true
    }
}

#[async_trait]
impl ConversationSupport for LocalClient {
    async fn process_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<String, ModelError> {
        let messages = self.replay_window(session);
        self.execute(&messages).await
    }

    async fn process_conversation_with_tools(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        // Local models get the latest user turn only; full replay with
        // the tool contract overwhelms small context windows.
        let message = session.last_user_message().unwrap_or_default().to_string();
        self.process_with_tools(&message, tools, caller, display).await
    }

    fn supports_conversation(&self) -> bool {
        true
    }
}

#[async_trait]
impl StreamingSupport for LocalClient {
    async fn stream_message(
        &self,
        message: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        let messages = vec![SimpleMessage {
            role: "user".to_string(),
            content: message.to_string(),
        }];
        self.open_stream(messages, message).await
    }

    async fn stream_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        let messages = self.replay_window(session);
        let fallback = session.last_user_message().unwrap_or_default().to_string();
        self.open_stream(messages, &fallback).await
    }

    fn supports_streaming(&self) -> bool {
        self.is_ollama()
    }
}

impl LocalClient {
    async fn open_stream(
        &self,
        messages: Vec<SimpleMessage>,
        fallback_message: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        let endpoint = self.require_endpoint()?;

        if !self.is_ollama() {
            // OpenAI-compatible local servers fall back to a single
            // terminal emission.
            let result = if messages.len() == 1 {
                self.process_message(fallback_message).await
            } else {
                self.execute(&messages).await
            };
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                match result {
                    Ok(content) => {
                        let _ = tx.send(StreamChunk::text(content)).await;
                        let _ = tx.send(StreamChunk::done()).await;
                    }
                    Err(err) => {
                        let _ = tx.send(StreamChunk::error(err.to_string())).await;
                    }
                }
            });
            return Ok(rx);
        }

        let headers = self.auth_headers();
        let header_refs: Vec<(&str, &str)> =
            headers.iter().map(|(n, v)| (*n, v.as_str())).collect();
        let body = OllamaRequest {
            model: &self.provider.model,
            messages: &messages,
            stream: true,
        };
        let response = self.http.post_json(endpoint, &header_refs, &body).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump_response(response, NdjsonParser, tx));
        Ok(rx)
    }
}

impl FullClient for LocalClient {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            tools: true,
            conversation: true,
            streaming: self.is_ollama(),
            max_tokens: 4096,
            max_conversation_turns: LOCAL_MAX_CONVERSATION_TURNS,
        }
    }
}

pub(crate) fn is_ollama_endpoint(endpoint: &str) -> bool {
    let lowered = endpoint.to_lowercase();
    lowered.contains(OLLAMA_PORT_PATTERN)
        || lowered.contains(OLLAMA_NAME_PATTERN)
        || lowered.ends_with(OLLAMA_CHAT_PATH)
}

/// Appends `/api/chat` to endpoints that name an Ollama host but omit
/// the chat path.
pub(crate) fn normalize_local_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    let lowered = trimmed.to_lowercase();
    if (lowered.contains(OLLAMA_PORT_PATTERN) || lowered.contains(OLLAMA_NAME_PATTERN))
        && !lowered.ends_with(OLLAMA_CHAT_PATH)
    {
        return format!("{trimmed}{OLLAMA_CHAT_PATH}");
    }
    trimmed.to_string()
}

#[derive(Debug, Deserialize)]
struct ToolUseRequest {
    #[serde(rename = "use_tool")]
    tool: String,
    #[serde(default)]
    parameters: Value,
}

struct ParsedToolCall {
    tool: String,
    parameters: Value,
}

/// Balanced-brace extraction starting at the literal `{"use_tool"`
/// prefix. Anything malformed is treated as plain prose.
fn parse_tool_call(content: &str) -> Option<ParsedToolCall> {
    let start = content.find(TOOL_USE_PREFIX)?;
    let tail = &content[start..];

    let mut depth = 0usize;
    let mut end = None;
    for (index, byte) in tail.bytes().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    end = Some(index + 1);
                    break;
                }
            }
            _ => {}
        }
    }

    let candidate = &tail[..end?];
    let request: ToolUseRequest = serde_json::from_str(candidate).ok()?;
    if request.tool.is_empty() {
        return None;
    }
    let parameters = match request.parameters {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    Some(ParsedToolCall {
        tool: request.tool,
        parameters,
    })
}

/// Tries the known response shapes in order: Ollama NDJSON, single
/// Ollama object, OpenAI chat shape, then generic content scavenging.
fn parse_local_body(body: &str, is_ollama: bool) -> Option<String> {
    if is_ollama {
        if let Some(content) = parse_ndjson_body(body) {
            return Some(content);
        }
        if let Ok(single) = serde_json::from_str::<OllamaResponse>(body) {
            if let Some(message) = single.message {
                return Some(message.content);
            }
        }
    }

    if let Ok(compat) = serde_json::from_str::<CompatResponse>(body) {
        if let Some(choice) = compat.choices.into_iter().next() {
            if let Some(message) = choice.message {
                return Some(message.content);
            }
        }
    }

    scavenge_content(body)
}

fn parse_ndjson_body(body: &str) -> Option<String> {
    let mut assembled = String::new();
    let mut parsed_any = false;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<OllamaResponse>(line) else {
            continue;
        };
        parsed_any = true;
        if let Some(message) = chunk.message {
            assembled.push_str(&message.content);
        }
        if chunk.done {
            break;
        }
    }
    (parsed_any && !assembled.is_empty()).then_some(assembled)
}

/// Last-resort extraction for unknown local server shapes.
fn scavenge_content(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    for field in ["content", "text", "response", "message", "output"] {
        if let Some(content) = value.get(field).and_then(Value::as_str) {
            return Some(content.to_string());
        }
    }
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn truncate_chars(content: &str, limit: usize) -> String {
    if content.chars().count() <= limit {
        return content.to_string();
    }
    content.chars().take(limit).collect()
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [SimpleMessage],
    stream: bool,
}

#[derive(Serialize)]
struct CompatRequest<'a> {
    model: &'a str,
    messages: &'a [SimpleMessage],
}

#[derive(Debug, Clone, Serialize)]
struct SimpleMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct CompatResponse {
    #[serde(default)]
    choices: Vec<CompatChoice>,
}

#[derive(Deserialize)]
struct CompatChoice {
    #[serde(default)]
    message: Option<CompatMessage>,
}

#[derive(Deserialize)]
struct CompatMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderKind;
    use serde_json::json;

    fn client(endpoint: &str) -> LocalClient {
        let mut provider = LlmProvider::new("local", ProviderKind::Local, "llama3");
        provider.endpoint = endpoint.to_string();
        LocalClient::new(provider, Arc::new(PromptCatalog::new()))
    }

    #[test]
    fn ollama_endpoints_are_detected() {
        assert!(is_ollama_endpoint("http://host:11434"));
        assert!(is_ollama_endpoint("http://my-ollama.internal/api"));
        assert!(is_ollama_endpoint("http://server/api/chat"));
        assert!(!is_ollama_endpoint("http://host:8000/v1/chat/completions"));
    }

    #[test]
    fn normalization_appends_the_chat_path() {
        assert_eq!(
            normalize_local_endpoint("http://host:11434"),
            "http://host:11434/api/chat"
        );
        assert_eq!(
            normalize_local_endpoint("http://host:11434/"),
            "http://host:11434/api/chat"
        );
        assert_eq!(
            normalize_local_endpoint("http://host:11434/api/chat"),
            "http://host:11434/api/chat"
        );
        assert_eq!(
            normalize_local_endpoint("http://host:8000/v1"),
            "http://host:8000/v1"
        );
    }

    #[test]
    fn tool_call_extraction_uses_balanced_braces() {
        let content = r#"Sure, let me check.
{"use_tool": "files_list_directory", "parameters": {"path": "/tmp", "options": {"all": true}}}
Done."#;
        let parsed = parse_tool_call(content).expect("tool call");
        assert_eq!(parsed.tool, "files_list_directory");
        assert_eq!(parsed.parameters["options"]["all"], json!(true));
    }

    #[test]
    fn prose_without_the_prefix_is_not_a_tool_call() {
        assert!(parse_tool_call("no tools needed here").is_none());
        assert!(parse_tool_call(r#"{"use_tool": ""}"#).is_none());
        assert!(parse_tool_call(r#"{"use_tool": "x", unbalanced"#).is_none());
    }

    #[test]
    fn missing_parameters_default_to_an_empty_object() {
        let parsed = parse_tool_call(r#"{"use_tool": "files_read"}"#).expect("tool call");
        assert!(parsed.parameters.is_object());
    }

    #[test]
    fn ndjson_body_concatenates_chunks() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        assert_eq!(parse_local_body(body, true).as_deref(), Some("Hello"));
    }

    #[test]
    fn openai_shape_parses_for_compat_servers() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        assert_eq!(parse_local_body(body, false).as_deref(), Some("hi"));
    }

    #[test]
    fn generic_bodies_are_scavenged() {
        assert_eq!(
            parse_local_body(r#"{"response":"from generic"}"#, false).as_deref(),
            Some("from generic")
        );
        assert_eq!(
            parse_local_body(r#"{"message":{"content":"nested"}}"#, false).as_deref(),
            Some("nested")
        );
        assert!(parse_local_body("not json", false).is_none());
    }

    #[test]
    fn replay_window_truncates_and_limits() {
        let mut session = ConversationSession::new();
        session.push(Role::System, "ignored");
        for index in 0..12 {
            session.push(Role::User, format!("m{index}{}", "x".repeat(2000)));
        }
        let client = client("http://host:11434/api/chat");
        let window = client.replay_window(&session);
        assert_eq!(window.len(), LOCAL_CONTEXT_WINDOW);
        assert!(window.iter().all(|m| m.content.chars().count() <= LOCAL_CONTENT_TRUNCATE));
        assert!(window.last().expect("last").content.starts_with("m11"));
    }

    #[test]
    fn missing_endpoint_is_a_configuration_error() {
        let client = client("");
        assert!(!client.healthy());
        assert!(matches!(
            client.require_endpoint().unwrap_err(),
            ModelError::MissingEndpoint
        ));
    }

    #[test]
    fn streaming_support_follows_the_dialect() {
        assert!(client("http://host:11434/api/chat").supports_streaming());
        assert!(!client("http://host:8000/v1/chat/completions").supports_streaming());
    }
}
