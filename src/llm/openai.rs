//! OpenAI-shaped client: chat completions with native function calling.
//! This client hosts the tool-calling loop because the wire format
//! interleaves assistant `tool_calls` and `tool` messages keyed by
//! `tool_call_id`.

use super::error::ModelError;
use super::http::HttpTransport;
use super::prompts::PromptCatalog;
use super::streaming::{pump_response, OpenAiSseParser};
use super::tooling::{run_tool_loop, ChatCompleter};
use super::{
    ClientCapabilities, ConversationSupport, FullClient, LlmClient, ProviderInfo,
    StreamingSupport, ToolCaller, ToolDefinition, ToolSupport, CLOUD_TIMEOUT,
    MAX_CONVERSATION_TURNS,
};
use crate::display::DisplaySink;
use crate::types::{
    ConversationMessage, ConversationSession, LlmProvider, Role, StreamChunk, ToolCall,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const API_VERSION: &str = "v1";

pub struct OpenAiClient {
    provider: LlmProvider,
    http: HttpTransport,
    prompts: Arc<PromptCatalog>,
}

impl OpenAiClient {
    pub fn new(provider: LlmProvider, prompts: Arc<PromptCatalog>) -> Self {
        Self {
            http: HttpTransport::new(provider.kind.as_str(), CLOUD_TIMEOUT),
            provider,
            prompts,
        }
    }

    fn endpoint(&self) -> &str {
        if self.provider.endpoint.is_empty() {
            CHAT_COMPLETIONS_URL
        } else {
            &self.provider.endpoint
        }
    }

    fn require_api_key(&self) -> Result<&str, ModelError> {
        let key = self.provider.api_key.trim();
        if key.is_empty() {
            return Err(ModelError::MissingApiKey {
                kind: self.provider.kind.as_str().to_string(),
            });
        }
        Ok(key)
    }

    async fn execute(&self, request: &ChatRequest<'_>) -> Result<ConversationMessage, ModelError> {
        let key = self.require_api_key()?;
        let bearer = format!("Bearer {key}");
        let response: ChatResponse = self
            .http
            .post_json_decoded(self.endpoint(), &[("Authorization", bearer.as_str())], request)
            .await?;

        if let Some(error) = response.error {
            return Err(ModelError::invalid_response(
                self.provider.kind.as_str(),
                error.message,
            ));
        }
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| {
                ModelError::invalid_response(self.provider.kind.as_str(), "no response choices")
            })?;
        Ok(choice.message.into_message())
    }

    fn request<'a>(
        &'a self,
        messages: Vec<WireMessage>,
        tools: &[ToolDefinition],
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.provider.model,
            messages,
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(WireTool::from).collect())
            },
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            stream,
        }
    }

    async fn open_stream(
        &self,
        messages: Vec<WireMessage>,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        let key = self.require_api_key()?;
        let bearer = format!("Bearer {key}");
        let request = self.request(messages, &[], true);
        let response = self
            .http
            .post_json(self.endpoint(), &[("Authorization", bearer.as_str())], &request)
            .await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump_response(response, OpenAiSseParser, tx));
        Ok(rx)
    }
}

#[async_trait]
impl ChatCompleter for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ConversationMessage],
        tools: &[ToolDefinition],
    ) -> Result<ConversationMessage, ModelError> {
        let wire: Vec<WireMessage> = messages.iter().map(WireMessage::from).collect();
        debug!(messages = wire.len(), tools = tools.len(), "sending chat completion request");
        let request = self.request(wire, tools, false);
        self.execute(&request).await
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn process_message(&self, message: &str) -> Result<String, ModelError> {
        let messages = vec![WireMessage::user(message)];
        let request = self.request(messages, &[], false);
        Ok(self.execute(&request).await?.content)
    }

    fn provider_info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: self.provider.kind,
            model: self.provider.model.clone(),
            endpoint: self.provider.endpoint.clone(),
            version: API_VERSION.to_string(),
        }
    }

    fn healthy(&self) -> bool {
        !self.provider.api_key.trim().is_empty()
    }
}

#[async_trait]
impl ToolSupport for OpenAiClient {
    async fn process_with_tools(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        self.require_api_key()?;
        let kind = self.provider.kind.as_str();
        let mut messages = vec![
            ConversationMessage::text(Role::System, self.prompts.system_prompt(kind)),
            ConversationMessage::text(Role::User, message),
        ];
        run_tool_loop(
            self,
            &mut messages,
            tools,
            &caller,
            display.as_ref(),
            &self.prompts,
            kind,
        )
        .await
    }

    fn supports_function_calling(&self) -> bool {
        true
    }
}

#[async_trait]
impl ConversationSupport for OpenAiClient {
    async fn process_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<String, ModelError> {
        let messages: Vec<WireMessage> = session.messages.iter().map(WireMessage::from).collect();
        let request = self.request(messages, &[], false);
        Ok(self.execute(&request).await?.content)
    }

    async fn process_conversation_with_tools(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        caller: ToolCaller,
        display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        self.require_api_key()?;
        let kind = self.provider.kind.as_str();
        if !session.messages.iter().any(|m| m.role == Role::System) {
            session.messages.insert(
                0,
                ConversationMessage::text(Role::System, self.prompts.system_prompt(kind)),
            );
        }
        run_tool_loop(
            self,
            &mut session.messages,
            tools,
            &caller,
            display.as_ref(),
            &self.prompts,
            kind,
        )
        .await
    }

    fn supports_conversation(&self) -> bool {
        true
    }
}

#[async_trait]
impl StreamingSupport for OpenAiClient {
    async fn stream_message(
        &self,
        message: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        self.open_stream(vec![WireMessage::user(message)]).await
    }

    async fn stream_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        let messages = session.messages.iter().map(WireMessage::from).collect();
        self.open_stream(messages).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

impl FullClient for OpenAiClient {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            tools: true,
            conversation: true,
            streaming: true,
            max_tokens: max_tokens_for_model(&self.provider.model),
            max_conversation_turns: MAX_CONVERSATION_TURNS,
        }
    }
}

fn max_tokens_for_model(model: &str) -> u32 {
    if model.contains("gpt-4") {
        8192
    } else {
        4096
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl WireMessage {
    fn user(content: &str) -> Self {
        Self {
            role: Role::User.as_str().to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    fn into_message(self) -> ConversationMessage {
        ConversationMessage {
            role: Role::Assistant,
            content: self.content.unwrap_or_default(),
            tool_calls: self.tool_calls.unwrap_or_default(),
            tool_call_id: None,
            name: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl From<&ConversationMessage> for WireMessage {
    fn from(message: &ConversationMessage) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: if message.content.is_empty() && !message.tool_calls.is_empty() {
                None
            } else {
                Some(message.content.clone())
            },
            tool_calls: if message.tool_calls.is_empty() {
                None
            } else {
                Some(message.tool_calls.clone())
            },
            tool_call_id: message.tool_call_id.clone(),
            name: message.name.clone(),
        }
    }
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireToolFunction,
}

#[derive(Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&ToolDefinition> for WireTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            tool_type: "function",
            function: WireToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderKind;
    use serde_json::json;

    fn provider(api_key: &str) -> LlmProvider {
        let mut provider = LlmProvider::new("cloud", ProviderKind::OpenAi, "gpt-4");
        provider.api_key = api_key.to_string();
        provider
    }

    #[test]
    fn missing_api_key_fails_construction_checks() {
        let client = OpenAiClient::new(provider(""), Arc::new(PromptCatalog::new()));
        assert!(!client.healthy());
        assert!(matches!(
            client.require_api_key().unwrap_err(),
            ModelError::MissingApiKey { .. }
        ));
    }

    #[test]
    fn request_omits_tools_when_none_offered() {
        let client = OpenAiClient::new(provider("sk-x"), Arc::new(PromptCatalog::new()));
        let request = client.request(vec![WireMessage::user("hi")], &[], false);
        let encoded = serde_json::to_value(&request).expect("encode");
        assert!(encoded.get("tools").is_none());
        assert!(encoded.get("tool_choice").is_none());
        assert!(encoded.get("stream").is_none());
    }

    #[test]
    fn request_with_tools_sets_auto_choice() {
        let client = OpenAiClient::new(provider("sk-x"), Arc::new(PromptCatalog::new()));
        let tools = vec![ToolDefinition {
            name: "files_read".to_string(),
            description: "Read".to_string(),
            parameters: json!({"type": "object"}),
            provider: "files".to_string(),
        }];
        let request = client.request(vec![WireMessage::user("hi")], &tools, false);
        let encoded = serde_json::to_value(&request).expect("encode");
        assert_eq!(encoded["tool_choice"], "auto");
        assert_eq!(encoded["tools"][0]["type"], "function");
        assert_eq!(encoded["tools"][0]["function"]["name"], "files_read");
    }

    #[test]
    fn assistant_tool_call_messages_serialize_without_content() {
        let message = ConversationMessage::assistant_tool_calls(
            "",
            vec![ToolCall::new("c1", "files_read", r#"{"path":"/x"}"#)],
        );
        let wire = WireMessage::from(&message);
        let encoded = serde_json::to_value(&wire).expect("encode");
        assert!(encoded.get("content").is_none());
        assert_eq!(encoded["tool_calls"][0]["id"], "c1");
        assert_eq!(encoded["tool_calls"][0]["type"], "function");
    }

    #[test]
    fn tool_result_messages_carry_the_call_id() {
        let message = ConversationMessage::tool_result("c1", "files_read", "{}");
        let wire = WireMessage::from(&message);
        let encoded = serde_json::to_value(&wire).expect("encode");
        assert_eq!(encoded["role"], "tool");
        assert_eq!(encoded["tool_call_id"], "c1");
        assert_eq!(encoded["name"], "files_read");
    }

    #[test]
    fn response_choice_decodes_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": {"name": "files_read", "arguments": "{\"path\":\"/x\"}"}
                    }]
                }
            }]
        });
        let response: ChatResponse = serde_json::from_value(body).expect("decode");
        let message = response.choices.into_iter().next().expect("choice").message.into_message();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].function.name, "files_read");
    }

    #[test]
    fn capabilities_reflect_the_model() {
        let client = OpenAiClient::new(provider("sk-x"), Arc::new(PromptCatalog::new()));
        let capabilities = client.capabilities();
        assert!(capabilities.tools);
        assert_eq!(capabilities.max_tokens, 8192);
        assert_eq!(capabilities.max_conversation_turns, MAX_CONVERSATION_TURNS);
    }
}
