//! Fakes shared by the unit tests: a scripted generator and an in-process
//! tool host with the same tools as `demo-tool-server`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::llm::{ChatRequest, ChatResponse, GeneratorPool, LlmClient, PoolStrategy, ProviderConfig, Role};
use crate::mcp::{resolve_tool, ToolCallResult, ToolInvoker, ToolWrapper};

type Responder = dyn Fn(&ChatRequest) -> String + Send + Sync;

/// Generator whose replies are computed from the request.
pub struct ScriptedLlm {
    respond: Box<Responder>,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(respond: impl Fn(&ChatRequest) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChatResponse::text((self.respond)(&request)))
    }
}

pub fn system_prompt(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .and_then(|m| m.text_content())
        .unwrap_or_default()
}

pub fn user_prompt(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.text_content())
        .unwrap_or_default()
}

pub fn generator(client: Arc<ScriptedLlm>) -> Arc<GeneratorPool> {
    let client: Arc<dyn LlmClient> = client;
    Arc::new(GeneratorPool::new(
        PoolStrategy::RoundRobin,
        Duration::from_secs(5),
        vec![(ProviderConfig::new("scripted", "http://unused", "test-model"), client)],
    ))
}

pub const SUM_PLAN: &str = r#"{"goal": "sum 2 and 3", "steps": [{"step_number": 1, "tool": "math_add", "arguments": {"a": 2, "b": 3}, "description": "add", "expected_output": "sum", "depends_on": []}], "output_format": "number"}"#;

/// Replies for every prompt an agent issues, steering it through a one-step
/// `math_add` plan.
pub fn agent_reply(request: &ChatRequest) -> Option<String> {
    let system = system_prompt(request);
    if system.contains("Classify the user's request") {
        Some(r#"{"intent": "calculation", "confidence": 0.9, "needs_tools": true}"#.to_string())
    } else if system.contains("Decide whether") {
        Some(r#"{"needs_tools": true}"#.to_string())
    } else if system.contains("planning engine") {
        Some(SUM_PLAN.to_string())
    } else if system.contains("final answer") {
        Some("The sum is 5.".to_string())
    } else if system.contains("Rewrite the request") {
        Some(format!("{} (with context)", user_prompt(request)))
    } else {
        None
    }
}

/// In-process tool host: `math_add`, `echo`, `flaky` and `slow` on server
/// `demo`.
pub struct DemoTools {
    pub calls: Mutex<Vec<(String, Value)>>,
    pub delay: Duration,
}

impl DemoTools {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn demo_tool(name: &str, description: &str, schema: Value) -> ToolWrapper {
    ToolWrapper {
        name: format!("demo_{}", name),
        original_name: name.to_string(),
        description: description.to_string(),
        server_name: "demo".to_string(),
        schema,
    }
}

#[async_trait]
impl ToolInvoker for DemoTools {
    async fn list_tools(&self) -> Vec<ToolWrapper> {
        vec![
            demo_tool(
                "math_add",
                "Add two numbers",
                json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}, "required": ["a", "b"]}),
            ),
            demo_tool(
                "echo",
                "Echo text back",
                json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            ),
            demo_tool("flaky", "Always fails", json!({"type": "object"})),
        ]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let catalog = self.list_tools().await;
        let tool = resolve_tool(&catalog, name).ok_or_else(|| Error::ToolNotFound(name.to_string()))?;
        self.calls
            .lock()
            .unwrap()
            .push((tool.original_name.clone(), arguments.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(match tool.original_name.as_str() {
            "math_add" => {
                let sum = arguments["a"].as_f64().unwrap_or(0.0) + arguments["b"].as_f64().unwrap_or(0.0);
                ToolCallResult::ok(json!({ "sum": sum as i64 }), self.delay)
            }
            "echo" => ToolCallResult::ok(json!({ "value": arguments["text"] }), self.delay),
            _ => ToolCallResult::failed("boom", self.delay),
        })
    }
}
