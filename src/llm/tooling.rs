//! Tool-call validation, result formatting and the bounded tool-calling
//! loop shared by loop-hosting clients.

use super::error::ModelError;
use super::prompts::PromptCatalog;
use super::{ToolCaller, ToolDefinition, MAX_TOOL_ITERATIONS};
use crate::display::{ApprovalDecision, DisplaySink, ExecutionSummary, ToolCallRecord};
use crate::types::{ConversationMessage, ToolCall};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Sends the accumulated message sequence plus the tool catalog to a
/// backend and returns the next assistant turn. The loop below is
/// generic over this seam so it can run against any dialect.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(
        &self,
        messages: &[ConversationMessage],
        tools: &[ToolDefinition],
    ) -> Result<ConversationMessage, ModelError>;
}

/// Validates tool calls against the offered catalog and renders results
/// for model consumption.
pub struct ToolDispatcher<'a> {
    tools: &'a [ToolDefinition],
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(tools: &'a [ToolDefinition]) -> Self {
        Self { tools }
    }

    pub fn find(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Checks the name against the catalog and the arguments against the
    /// schema's `required` list, returning the resolved tool. The error
    /// text is embedded verbatim into the conversation as a tool-role
    /// turn.
    pub fn validate(&self, name: &str, args: &Value) -> Result<&ToolDefinition, String> {
        let Some(tool) = self.find(name) else {
            let offered: Vec<&str> = self.tools.iter().map(|t| t.name.as_str()).collect();
            return Err(format!(
                "Tool '{name}' not found. Available tools: {}",
                offered.join(", ")
            ));
        };

        if let Some(required) = tool.parameters.get("required").and_then(Value::as_array) {
            for entry in required {
                if let Some(parameter) = entry.as_str() {
                    if args.get(parameter).is_none() {
                        return Err(format!(
                            "required parameter '{parameter}' missing for tool '{name}'"
                        ));
                    }
                }
            }
        }
        Ok(tool)
    }

    /// JSON-encodes structured results and stringifies primitives, then
    /// appends advisory breadcrumbs for empty or path-not-found results.
    /// The breadcrumb only decorates the text routed to the model; the
    /// structured value is untouched.
    pub fn format_result(value: &Value) -> String {
        let mut rendered = match value {
            Value::Null => "null".to_string(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };

        if rendered.contains("[]") || rendered.contains("{}") {
            rendered.push_str(
                "\n\n[System: Empty result detected. Try alternative locations or methods.]",
            );
        }
        if rendered.contains("error") && rendered.contains("ENOENT") {
            rendered.push_str(
                "\n\n[System: Path not found. Try alternative paths before giving up.]",
            );
        }
        rendered
    }
}

fn summarize(records: &[ToolCallRecord]) -> ExecutionSummary {
    let successful = records.iter().filter(|r| r.success).count();
    ExecutionSummary {
        total_calls: records.len(),
        successful,
        failed: records.len() - successful,
        total_duration: records.iter().map(|r| r.duration).sum(),
        calls: records.to_vec(),
    }
}

/// The tool-calling loop.
///
/// Each iteration sends the full sequence to the backend, appends the
/// assistant turn verbatim, and terminates when that turn carries no
/// tool calls. Tool calls are dispatched in emission order and each
/// appends exactly one tool-role turn; tool-level failures are embedded
/// as conversation context rather than failing the loop. The loop fails
/// only on the iteration cap or an interactive abort.
pub async fn run_tool_loop<C>(
    completer: &C,
    messages: &mut Vec<ConversationMessage>,
    tools: &[ToolDefinition],
    caller: &ToolCaller,
    display: Option<&Arc<dyn DisplaySink>>,
    catalog: &PromptCatalog,
    backend: &str,
) -> Result<String, ModelError>
where
    C: ChatCompleter + ?Sized,
{
    let dispatcher = ToolDispatcher::new(tools);
    let mut approve_all = false;
    let mut records: Vec<ToolCallRecord> = Vec::new();

    for iteration in 0..MAX_TOOL_ITERATIONS {
        debug!(iteration, pending_messages = messages.len(), "submitting tool-loop turn");
        let assistant = completer.complete(messages, tools).await?;
        let tool_calls = assistant.tool_calls.clone();
        let content = assistant.content.clone();
        messages.push(assistant);

        if tool_calls.is_empty() {
            if let Some(sink) = display {
                if !records.is_empty() {
                    sink.summary(&summarize(&records)).await;
                }
            }
            return Ok(content);
        }

        for call in &tool_calls {
            let name = call.function.name.as_str();

            let args: Value = match serde_json::from_str(&call.function.arguments) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(_) => {
                    messages.push(ConversationMessage::tool_result(
                        &call.id,
                        name,
                        "Error parsing arguments: expected a JSON object",
                    ));
                    continue;
                }
                Err(err) => {
                    messages.push(ConversationMessage::tool_result(
                        &call.id,
                        name,
                        format!("Error parsing arguments: {err}"),
                    ));
                    continue;
                }
            };

            let provider = match dispatcher.validate(name, &args) {
                Ok(tool) => tool.provider.clone(),
                Err(reason) => {
                    warn!(tool = name, %reason, "rejected tool call");
                    messages.push(ConversationMessage::tool_result(&call.id, name, reason));
                    continue;
                }
            };

            if let Some(sink) = display {
                sink.tool_call(&provider, name, &args).await;
                if !approve_all {
                    match sink.approve(&provider, name, &args).await {
                        ApprovalDecision::Approve => {}
                        ApprovalDecision::ApproveAll => approve_all = true,
                        ApprovalDecision::Deny => {
                            messages.push(ConversationMessage::tool_result(
                                &call.id,
                                name,
                                "Tool execution skipped by user",
                            ));
                            continue;
                        }
                        ApprovalDecision::Abort => {
                            sink.error("tool execution aborted by user").await;
                            return Err(ModelError::Aborted);
                        }
                    }
                }
            }

            let started = Instant::now();
            match (caller)(name.to_string(), args).await {
                Ok(value) => {
                    let duration = started.elapsed();
                    info!(
                        provider = %provider,
                        tool = name,
                        elapsed_ms = duration.as_millis() as u64,
                        "tool executed"
                    );
                    if let Some(sink) = display {
                        sink.tool_result(&value, duration).await;
                    }
                    records.push(ToolCallRecord {
                        provider: provider.clone(),
                        tool: name.to_string(),
                        duration,
                        success: true,
                        error: None,
                    });
                    messages.push(ConversationMessage::tool_result(
                        &call.id,
                        name,
                        ToolDispatcher::format_result(&value),
                    ));
                }
                Err(message) => {
                    warn!(provider = %provider, tool = name, error = %message, "tool execution failed");
                    if let Some(sink) = display {
                        sink.error(&message).await;
                    }
                    records.push(ToolCallRecord {
                        provider: provider.clone(),
                        tool: name.to_string(),
                        duration: started.elapsed(),
                        success: false,
                        error: Some(message.clone()),
                    });
                    let hint = catalog.error_hint(backend, PromptCatalog::classify_error(&message));
                    let content = if hint.is_empty() {
                        format!("Error: {message}")
                    } else {
                        format!("Error: {message}\nHint: {hint}")
                    };
                    messages.push(ConversationMessage::tool_result(&call.id, name, content));
                }
            }
        }
    }

    Err(ModelError::MaxIterations {
        limit: MAX_TOOL_ITERATIONS,
    })
}
