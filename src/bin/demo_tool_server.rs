//! Demo MCP tool server.
//!
//! Serves `math_add`, `echo`, `flaky` and `slow` over stdio using
//! newline-delimited JSON-RPC 2.0. Used by the broker integration tests and
//! for trying the runtime locally.
//!
//! Flags:
//! - `--fail-on-start`: exit with status 1 before answering anything.
//! - `--name <name>`: server name reported from `initialize`.
//! - `--startup-delay-ms <ms>`: sleep before reading requests.

use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolResult {
    content: Vec<ToolContent>,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    structured_content: Option<Value>,
    #[serde(rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
}

impl ToolResult {
    fn ok(data: Value) -> Self {
        Self {
            content: vec![ToolContent::Text { text: data.to_string() }],
            structured_content: Some(data),
            is_error: false,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: message.into() }],
            structured_content: None,
            is_error: true,
        }
    }
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "math_add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }
        },
        {
            "name": "echo",
            "description": "Echo text back",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        },
        {
            "name": "flaky",
            "description": "Always fails",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "slow",
            "description": "Sleep for `ms` milliseconds, then answer",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer", "minimum": 0}}
            }
        }
    ])
}

fn call_tool(name: &str, args: &Value) -> ToolResult {
    match name {
        "math_add" => {
            let (Some(a), Some(b)) = (args["a"].as_f64(), args["b"].as_f64()) else {
                return ToolResult::failed("math_add needs numeric a and b");
            };
            let sum = a + b;
            if sum.fract() == 0.0 {
                ToolResult::ok(json!({ "sum": sum as i64 }))
            } else {
                ToolResult::ok(json!({ "sum": sum }))
            }
        }
        "echo" => ToolResult::ok(json!({ "value": args["text"] })),
        "flaky" => ToolResult::failed("boom"),
        "slow" => {
            let ms = args["ms"].as_u64().unwrap_or(1000);
            std::thread::sleep(Duration::from_millis(ms));
            ToolResult::ok(json!({ "slept_ms": ms }))
        }
        other => ToolResult::failed(format!("Unknown tool: {}", other)),
    }
}

fn handle_request(request: &JsonRpcRequest, server_name: &str) -> Option<JsonRpcResponse> {
    // Notifications carry no id and get no answer.
    let id = request.id.clone()?;
    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": server_name, "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {"tools": {"listChanged": false}}
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let name = request.params["name"].as_str().unwrap_or_default();
            let args = request.params.get("arguments").cloned().unwrap_or(json!({}));
            eprintln!("[demo-tool-server] call {}", name);
            JsonRpcResponse::success(id, json!(call_tool(name, &args)))
        }
        other => JsonRpcResponse::error(id, -32601, format!("Method not found: {}", other)),
    };
    Some(response)
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--fail-on-start") {
        eprintln!("[demo-tool-server] refusing to start");
        std::process::exit(1);
    }
    let server_name = args
        .iter()
        .position(|a| a == "--name")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "demo-tool-server".to_string());
    let startup_delay = args
        .iter()
        .position(|a| a == "--startup-delay-ms")
        .and_then(|i| args.get(i + 1))
        .and_then(|ms| ms.parse().ok())
        .unwrap_or(0);
    std::thread::sleep(Duration::from_millis(startup_delay));
    eprintln!("[demo-tool-server] ready as {}", server_name);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in BufReader::new(stdin.lock()).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => handle_request(&request, &server_name),
            Err(e) => Some(JsonRpcResponse::error(Value::Null, -32700, e.to_string())),
        };
        if let Some(response) = response {
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = writeln!(stdout, "{}", text);
                let _ = stdout.flush();
            }
        }
    }
}
