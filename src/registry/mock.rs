//! Built-in mock provider used when the launch spec is the literal
//! `echo` or `mock`. Backs its tools with the local filesystem so the
//! agent wiring can be exercised without a real MCP server.

use super::error::RegistryError;
use super::McpConnection;
use crate::types::ToolDescriptor;
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct MockConnection {
    name: String,
    tools: Vec<ToolDescriptor>,
}

impl MockConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: mock_tools(),
        }
    }

    fn error(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::Rpc {
            name: self.name.clone(),
            code: -32000,
            message: message.into(),
        }
    }
}

fn mock_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "list_directory".to_string(),
            description: "List files and directories in a specified path".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory path to list",
                        "default": "."
                    }
                }
            }),
        },
        ToolDescriptor {
            name: "read_file".to_string(),
            description: "Read contents of a file".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path to read" }
                },
                "required": ["path"]
            }),
        },
        ToolDescriptor {
            name: "execute_command".to_string(),
            description: "Execute a shell command".to_string(),
            schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Command to execute" }
                },
                "required": ["command"]
            }),
        },
    ]
}

#[async_trait]
impl McpConnection for MockConnection {
    async fn start(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RegistryError> {
        match name {
            "list_directory" => {
                let path = arguments
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or(".");
                let entries = std::fs::read_dir(path)
                    .map_err(|err| self.error(format!("failed to read directory: {err}")))?;
                let mut listing = Vec::new();
                for entry in entries.flatten() {
                    let kind = entry
                        .file_type()
                        .map(|t| if t.is_dir() { "directory" } else { "file" })
                        .unwrap_or("file");
                    listing.push(json!({
                        "name": entry.file_name().to_string_lossy(),
                        "type": kind,
                    }));
                }
                Ok(json!({ "path": path, "entries": listing }))
            }
            "read_file" => {
                let path = arguments
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.error("missing 'path' argument"))?;
                let content = std::fs::read_to_string(path)
                    .map_err(|err| self.error(format!("failed to read file: {err}")))?;
                Ok(json!({ "path": path, "content": content }))
            }
            "execute_command" => {
                let command = arguments
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.error("missing 'command' argument"))?;
                // Only a fixed allow-list actually runs; anything else
                // gets a canned response instead of a shell.
                let output = match command {
                    "pwd" => std::env::current_dir()
                        .map(|dir| dir.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    "date" => chrono::Utc::now()
                        .format("%a %b %e %H:%M:%S UTC %Y")
                        .to_string(),
                    "whoami" => "opsrelay-user".to_string(),
                    other => format!("Mock: would execute '{other}'"),
                };
                Ok(json!({
                    "command": command,
                    "output": output,
                    "status": 0,
                }))
            }
            other => Err(self.error(format!("tool '{other}' not found"))),
        }
    }

    async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }
}
