//! Anthropic-shaped client. Tools are offered through system-prompt
//! augmentation only; this client never invokes them itself.

use super::error::ModelError;
use super::http::HttpTransport;
use super::prompts::PromptCatalog;
use super::streaming::{pump_response, AnthropicSseParser};
use super::{
    ClientCapabilities, ConversationSupport, FullClient, LlmClient, ProviderInfo,
    StreamingSupport, ToolCaller, ToolDefinition, ToolSupport, CLOUD_TIMEOUT,
};
use crate::display::DisplaySink;
use crate::types::{ConversationSession, LlmProvider, Role, StreamChunk};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const MAX_CONVERSATION_TURNS: u32 = 100;

pub struct AnthropicClient {
    provider: LlmProvider,
    http: HttpTransport,
    prompts: Arc<PromptCatalog>,
}

impl AnthropicClient {
    pub fn new(provider: LlmProvider, prompts: Arc<PromptCatalog>) -> Self {
        Self {
            http: HttpTransport::new(provider.kind.as_str(), CLOUD_TIMEOUT),
            provider,
            prompts,
        }
    }

    fn endpoint(&self) -> &str {
        if self.provider.endpoint.is_empty() {
            MESSAGES_URL
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

    async fn execute(&self, request: &MessagesRequest<'_>) -> Result<String, ModelError> {
        let key = self.require_api_key()?;
        let response: MessagesResponse = self
            .http
            .post_json_decoded(
                self.endpoint(),
                &[("x-api-key", key), ("anthropic-version", API_VERSION)],
                request,
            )
            .await?;

        if let Some(error) = response.error {
            return Err(ModelError::invalid_response(
                self.provider.kind.as_str(),
                error.message,
            ));
        }
        response
            .content
            .into_iter()
            .find(|block| block.block_type == "text")
            .map(|block| block.text)
            .ok_or_else(|| {
                ModelError::invalid_response(
                    self.provider.kind.as_str(),
                    "no text content found in response",
                )
            })
    }

    /// The system prompt moves to the top-level `system` field; every
    /// other turn is replayed in order. Tool-role turns become user
    /// turns since the wire format has no tool role here.
    fn convert_session(&self, session: &ConversationSession) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut messages = Vec::with_capacity(session.messages.len());
        for message in &session.messages {
            match message.role {
                Role::System => system = Some(message.content.clone()),
                Role::Tool => messages.push(WireMessage {
                    role: "user".to_string(),
                    content: message.content.clone(),
                }),
                role => messages.push(WireMessage {
                    role: role.as_str().to_string(),
                    content: message.content.clone(),
                }),
            }
        }
        (system, messages)
    }

    fn augment_with_tools(&self, base: &str, tools: &[ToolDefinition]) -> String {
        if tools.is_empty() {
            return base.to_string();
        }
        let mut augmented = String::from("Available tools:\n");
        for tool in tools {
            augmented.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        augmented.push('\n');
        augmented.push_str(base);
        augmented.push_str(
            "\n\nWhen you need to use tools, clearly indicate which tool you would use and \
             with what parameters.",
        );
        augmented
    }

    async fn open_stream(
        &self,
        system: Option<String>,
        messages: Vec<WireMessage>,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        let key = self.require_api_key()?;
        let request = MessagesRequest {
            model: &self.provider.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages,
            system,
            stream: true,
        };
        let response = self
            .http
            .post_json(
                self.endpoint(),
                &[("x-api-key", key), ("anthropic-version", API_VERSION)],
                &request,
            )
            .await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump_response(response, AnthropicSseParser, tx));
        Ok(rx)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn process_message(&self, message: &str) -> Result<String, ModelError> {
        let request = MessagesRequest {
            model: &self.provider.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: message.to_string(),
            }],
            system: None,
            stream: false,
        };
        self.execute(&request).await
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
impl ToolSupport for AnthropicClient {
    async fn process_with_tools(
        &self,
        message: &str,
        tools: &[ToolDefinition],
        _caller: ToolCaller,
        _display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        // Tools are described, never dispatched, on this backend.
        let augmented = self.augment_with_tools(message, tools);
        self.process_message(&augmented).await
    }

    fn supports_function_calling(&self) -> bool {
        false
    }
}

#[async_trait]
impl ConversationSupport for AnthropicClient {
    async fn process_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<String, ModelError> {
        let (system, messages) = self.convert_session(session);
        let kind = self.provider.kind.as_str();
        let request = MessagesRequest {
            model: &self.provider.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages,
            system: Some(system.unwrap_or_else(|| self.prompts.system_prompt(kind).to_string())),
            stream: false,
        };
        self.execute(&request).await
    }

    async fn process_conversation_with_tools(
        &self,
        session: &mut ConversationSession,
        tools: &[ToolDefinition],
        _caller: ToolCaller,
        _display: Option<Arc<dyn DisplaySink>>,
    ) -> Result<String, ModelError> {
        let (system, messages) = self.convert_session(session);
        let kind = self.provider.kind.as_str();
        let base = system.unwrap_or_else(|| self.prompts.system_prompt(kind).to_string());
        let request = MessagesRequest {
            model: &self.provider.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages,
            system: Some(self.augment_with_tools(&base, tools)),
            stream: false,
        };
        self.execute(&request).await
    }

    fn supports_conversation(&self) -> bool {
        true
    }
}

#[async_trait]
impl StreamingSupport for AnthropicClient {
    async fn stream_message(
        &self,
        message: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        self.open_stream(
            None,
            vec![WireMessage {
                role: "user".to_string(),
                content: message.to_string(),
            }],
        )
        .await
    }

    async fn stream_conversation(
        &self,
        session: &ConversationSession,
    ) -> Result<mpsc::Receiver<StreamChunk>, ModelError> {
        let (system, messages) = self.convert_session(session);
        self.open_stream(system, messages).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

impl FullClient for AnthropicClient {
    fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            tools: false,
            conversation: true,
            streaming: true,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_conversation_turns: MAX_CONVERSATION_TURNS,
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}
