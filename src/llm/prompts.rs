//! Prompt catalog: per-backend system prompts, tool-context fragments,
//! conversation hints and error remediation hints. Unknown backends fall
//! back to the OpenAI template set.

use std::collections::HashMap;

use super::ToolDefinition;

pub const ERROR_FILE_NOT_FOUND: &str = "file_not_found";
pub const ERROR_PERMISSION_DENIED: &str = "permission_denied";
pub const ERROR_NETWORK: &str = "network_error";
pub const ERROR_TOOL: &str = "tool_error";

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system: String,
    pub tool_context: String,
    pub conversation: String,
    pub error_hints: HashMap<&'static str, String>,
}

#[derive(Debug, Clone)]
pub struct PromptCatalog {
    templates: HashMap<String, PromptTemplate>,
}

impl PromptCatalog {
    pub fn new() -> Self {
        let mut templates = HashMap::new();

        templates.insert(
            "openai".to_string(),
            PromptTemplate {
                system: "You are a helpful AI assistant with access to system tools. \
                         Use the available tools to provide comprehensive and accurate responses. \
                         When using tools, explain what you're doing and why."
                    .to_string(),
                tool_context: "Available tools: {count} desktop tools including file operations, \
                               system commands, and process management. Use multiple tools as \
                               needed to provide comprehensive answers."
                    .to_string(),
                conversation: "Continue the conversation naturally, maintaining context from \
                               previous messages. Use available tools when needed to provide \
                               accurate and helpful responses."
                    .to_string(),
                error_hints: HashMap::from([
                    (
                        ERROR_FILE_NOT_FOUND,
                        "The file or directory doesn't exist. Try checking the correct path or suggest alternatives.".to_string(),
                    ),
                    (
                        ERROR_PERMISSION_DENIED,
                        "Permission denied. Consider suggesting alternative approaches or checking file permissions.".to_string(),
                    ),
                    (
                        ERROR_NETWORK,
                        "Network connectivity issue. Try alternative approaches or suggest checking network connection.".to_string(),
                    ),
                    (
                        ERROR_TOOL,
                        "Tool execution failed. Try alternative tools or approaches to accomplish the task.".to_string(),
                    ),
                ]),
            },
        );

        templates.insert(
            "anthropic".to_string(),
            PromptTemplate {
                system: "You are Claude, a helpful AI assistant. You have access to various \
                         system tools that allow you to interact with the desktop environment. \
                         Use these tools thoughtfully to provide accurate and comprehensive \
                         responses."
                    .to_string(),
                tool_context: "You have access to {count} system tools for file operations, \
                               process management, and system commands. Utilize these tools \
                               effectively to gather information and complete tasks."
                    .to_string(),
                conversation: "Maintain conversation context and provide helpful, accurate \
                               responses. Leverage available tools to enhance your responses \
                               with real-time information."
                    .to_string(),
                error_hints: HashMap::from([
                    (
                        ERROR_FILE_NOT_FOUND,
                        "The requested file or directory could not be found. Please verify the path is correct.".to_string(),
                    ),
                    (
                        ERROR_PERMISSION_DENIED,
                        "Access denied to the requested resource. Consider alternative approaches.".to_string(),
                    ),
                    (
                        ERROR_NETWORK,
                        "Network connection issue encountered. Consider offline alternatives if available.".to_string(),
                    ),
                    (
                        ERROR_TOOL,
                        "Tool execution encountered an error. Consider using alternative methods.".to_string(),
                    ),
                ]),
            },
        );

        templates.insert(
            "local".to_string(),
            PromptTemplate {
                system: "You are a helpful AI assistant with access to system tools. \
                         Use the available tools to provide comprehensive and accurate responses."
                    .to_string(),
                tool_context: "Available tools: {count} desktop tools including file operations, \
                               system commands, and process management."
                    .to_string(),
                conversation: "Continue the conversation naturally, maintaining context from \
                               previous messages."
                    .to_string(),
                error_hints: HashMap::from([
                    (ERROR_FILE_NOT_FOUND, "Try list_directory with a different path".to_string()),
                    (ERROR_PERMISSION_DENIED, "Try an alternative approach or tool".to_string()),
                    (ERROR_NETWORK, "Use local tools only".to_string()),
                    (
                        ERROR_TOOL,
                        "Tool execution failed. Try alternative tools or approaches to accomplish the task.".to_string(),
                    ),
                ]),
            },
        );

        Self { templates }
    }

    fn template(&self, kind: &str) -> &PromptTemplate {
        self.templates
            .get(&kind.to_lowercase())
            .unwrap_or_else(|| &self.templates["openai"])
    }

    pub fn system_prompt(&self, kind: &str) -> &str {
        &self.template(kind).system
    }

    pub fn conversation_prompt(&self, kind: &str) -> &str {
        &self.template(kind).conversation
    }

    pub fn tool_context(&self, kind: &str, tool_count: usize) -> String {
        self.template(kind)
            .tool_context
            .replace("{count}", &tool_count.to_string())
    }

    pub fn error_hint(&self, kind: &str, error_kind: &str) -> &str {
        let template = self.template(kind);
        template
            .error_hints
            .get(error_kind)
            .or_else(|| template.error_hints.get(ERROR_TOOL))
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Maps raw error text onto a symbolic error kind by keyword.
    pub fn classify_error(error_text: &str) -> &'static str {
        let lowered = error_text.to_lowercase();
        if lowered.contains("no such file") || lowered.contains("enoent") {
            ERROR_FILE_NOT_FOUND
        } else if lowered.contains("permission denied") || lowered.contains("eacces") {
            ERROR_PERMISSION_DENIED
        } else if lowered.contains("network") || lowered.contains("connection refused") {
            ERROR_NETWORK
        } else {
            ERROR_TOOL
        }
    }
}

impl Default for PromptCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends the one-line tool-count note used by every processor before
/// delegating to a client. A zero count leaves the message unchanged.
pub fn enhance_message_with_tools(message: &str, tool_count: usize) -> String {
    if tool_count == 0 {
        return message.to_string();
    }
    format!(
        "{message}\n\nNote: You have access to {tool_count} tools for system operations. \
         Use them when appropriate to help with the user's request."
    )
}

/// The textual tool contract offered to local models that lack native
/// function calling.
pub fn local_tool_contract(tools: &[ToolDefinition]) -> String {
    let mut context = String::from("IMPORTANT: Available tools for use (use EXACT names):\n");
    for tool in tools {
        context.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }
    context.push_str(
        "\nCRITICAL RULES:\n\
         1. ONLY use tools from the list above with EXACT names\n\
         2. Tool format: {\"use_tool\": \"EXACT_TOOL_NAME\", \"parameters\": {\"key\": \"value\"}}\n\
         3. If no suitable tool exists, respond normally without tools\n",
    );
    context
}
