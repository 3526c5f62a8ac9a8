//! Tool servers speaking the Model Context Protocol over stdio.
//!
//! The [`ToolBroker`] supervises the subprocesses and exposes their tools as
//! one namespaced catalog. Everything above this module talks to tools
//! through the [`ToolInvoker`] trait.

mod broker;
mod config;
mod connection;
mod types;

pub use broker::ToolBroker;
pub use config::{validate_servers, ToolServerFile};
pub use connection::McpConnection;
pub use types::*;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::llm::{FunctionDefinition, ToolDefinition};

/// Anything that can list and invoke tools.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// The current aggregate catalog.
    async fn list_tools(&self) -> Vec<ToolWrapper>;

    /// Invoke a tool. `Err` means the call could not be routed; a tool
    /// that ran and failed returns `Ok` with `success = false`.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult>;

    /// Human-readable catalog block for prompts.
    async fn tools_description(&self) -> String {
        describe_tools(&self.list_tools().await)
    }

    /// Catalog in function-calling form.
    async fn tools_for_llm(&self) -> Vec<ToolDefinition> {
        self.list_tools().await.iter().map(tool_definition).collect()
    }
}

/// Function-calling definition for one catalog entry.
pub fn tool_definition(tool: &ToolWrapper) -> ToolDefinition {
    let parameters = if tool.schema.is_object() {
        tool.schema.clone()
    } else {
        serde_json::json!({"type": "object", "properties": {}})
    };
    ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters,
        },
    }
}

/// Format the catalog as the block the planner embeds in its prompt.
pub fn describe_tools(tools: &[ToolWrapper]) -> String {
    if tools.is_empty() {
        return "No tools are available.".to_string();
    }

    let mut out = String::from("Available tools:\n");
    for tool in tools {
        out.push_str(&format!("- {} (server: {}", tool.name, tool.server_name));
        if tool.original_name != tool.name {
            out.push_str(&format!(", also known as {}", tool.original_name));
        }
        out.push_str(")");
        if !tool.description.is_empty() {
            out.push_str(&format!(": {}", tool.description));
        }
        out.push('\n');

        let required: Vec<&str> = tool
            .schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(props) = tool.schema.get("properties").and_then(Value::as_object) {
            for (param, spec) in props {
                let ty = spec.get("type").and_then(Value::as_str).unwrap_or("any");
                let flag = if required.contains(&param.as_str()) { ", required" } else { "" };
                out.push_str(&format!("    {} ({}{})", param, ty, flag));
                if let Some(desc) = spec.get("description").and_then(Value::as_str) {
                    out.push_str(&format!(": {}", desc));
                }
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_tool() -> ToolWrapper {
        ToolWrapper::from_descriptor(
            "demo",
            McpToolDescriptor {
                name: "math_add".into(),
                description: "Add two numbers".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "a": {"type": "number", "description": "first addend"},
                        "b": {"type": "number"}
                    },
                    "required": ["a"]
                }),
            },
        )
    }

    #[test]
    fn description_lists_parameters() {
        let text = describe_tools(&[add_tool()]);
        assert!(text.contains("- demo_math_add (server: demo, also known as math_add): Add two numbers"));
        assert!(text.contains("a (number, required): first addend"));
        assert!(text.contains("b (number)"));
    }

    #[test]
    fn llm_definition_uses_qualified_name() {
        let def = tool_definition(&add_tool());
        let wire = serde_json::to_value(&def).unwrap();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "demo_math_add");
        assert_eq!(wire["function"]["parameters"]["required"], json!(["a"]));
    }

    #[test]
    fn empty_catalog_is_explicit() {
        assert_eq!(describe_tools(&[]), "No tools are available.");
    }
}
