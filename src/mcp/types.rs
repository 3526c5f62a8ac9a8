//! MCP wire types, tool-server configuration and the aggregate tool catalog.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a supervised tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Configured but never started (or stopped by `close`)
    Stopped,
    /// Process spawned, handshake in progress
    Starting,
    /// Handshake complete, tools registered
    Connected,
    /// Crashed or failed to start and will not be restarted
    Failed,
}

// ==================== JSON-RPC 2.0 Types ====================

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response)
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
        }
    }
}

/// Any message a server writes to stdout: a response, or a request /
/// notification of its own (which the broker ignores).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Numeric id of a response; `None` for server-initiated messages.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// MCP Initialize request params
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

/// Client capabilities for MCP
#[derive(Debug, Clone, Serialize, Default)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

/// Client info for MCP
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// MCP Initialize response result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Server info from MCP
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// MCP tool list response from server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolsResponse {
    pub tools: Vec<McpToolDescriptor>,
}

/// Tool descriptor from MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Response from calling an MCP tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpCallToolResponse {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default)]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl McpCallToolResponse {
    /// Concatenated text content.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The result payload: structured content when present, otherwise the
    /// text content parsed as JSON, otherwise the raw text.
    pub fn data(&self) -> Value {
        if let Some(structured) = &self.structured_content {
            return structured.clone();
        }
        let text = self.text();
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }
}

/// Content item from MCP response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

// ==================== Broker-facing types ====================

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    30
}

/// Configuration for a single supervised tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Unique name; also the namespace prefix of the server's tools
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Launch when the broker starts (otherwise on first use)
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Interval between liveness pings; 0 disables health checks
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl ToolServerConfig {
    /// Create a config with default supervision settings.
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
            auto_start: true,
            restart_on_failure: true,
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            startup_timeout_secs: default_startup_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

/// A tool in the aggregate catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolWrapper {
    /// Qualified name: `<server>_<tool>`
    pub name: String,
    /// Name as reported by the server
    pub original_name: String,
    pub description: String,
    pub server_name: String,
    /// JSON schema of the arguments
    pub schema: Value,
}

impl ToolWrapper {
    pub fn from_descriptor(server_name: &str, descriptor: McpToolDescriptor) -> Self {
        Self {
            name: qualified_name(server_name, &descriptor.name),
            original_name: descriptor.name,
            description: descriptor.description,
            server_name: server_name.to_string(),
            schema: descriptor.input_schema,
        }
    }
}

/// Namespace a tool name with its server.
pub fn qualified_name(server_name: &str, tool_name: &str) -> String {
    format!("{}_{}", server_name, tool_name)
}

/// Find a tool by exact qualified name, then by original name, then by
/// suffix match on the qualified name.
pub fn resolve_tool<'a>(catalog: &'a [ToolWrapper], name: &str) -> Option<&'a ToolWrapper> {
    catalog
        .iter()
        .find(|t| t.name == name)
        .or_else(|| catalog.iter().find(|t| t.original_name == name))
        .or_else(|| {
            let suffix = format!("_{}", name);
            catalog.iter().find(|t| t.name.ends_with(&suffix))
        })
}

/// Outcome of a single tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolCallResult {
    pub fn ok(data: Value, duration: Duration) -> Self {
        Self {
            success: true,
            data,
            error: None,
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            duration,
        }
    }
}

/// Point-in-time view of a supervised server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub server_version: Option<String>,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
