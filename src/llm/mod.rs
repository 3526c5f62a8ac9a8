//! Language-model and embedding clients.
//!
//! This module provides a trait-based abstraction over OpenAI-compatible
//! endpoints plus the load-balanced pools the rest of the runtime draws
//! generators and embedders from.

mod error;
pub mod intent;
mod openai;
mod pool;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use intent::{Intent, IntentResult};
pub use openai::OpenAiClient;
pub use pool::{
    ClientPool, EmbedderPool, GeneratorPool, Lease, PoolConfig, PoolStrategy, ProviderConfig,
    ProviderStatus,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// A tool result answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// Get the text content of this message.
    pub fn text_content(&self) -> Option<&str> {
        self.content.as_deref()
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Parsed arguments; malformed or empty argument text yields `{}`.
    pub fn arguments(&self) -> serde_json::Value {
        serde_json::from_str(&self.function.arguments)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

/// Function call details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string. May be empty or missing for no-argument functions.
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

/// Function definition with schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Optional parameters for chat completions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Top-p nucleus sampling.
    pub top_p: Option<f64>,
    /// Maximum output tokens to generate.
    pub max_tokens: Option<u64>,
    /// Ask the endpoint for a JSON object response.
    pub json_mode: bool,
}

impl ChatOptions {
    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            temperature: Some(temperature),
            ..Default::default()
        }
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// One chat completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub options: ChatOptions,
}

/// Response from a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

impl ChatResponse {
    /// A plain text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Incremental output of a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of assistant text, in emission order
    Text(String),
    /// A fully assembled tool call
    ToolCall(ToolCall),
    /// End of stream
    Done { finish_reason: Option<String> },
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request.
    async fn chat_completion(&self, request: ChatRequest) -> anyhow::Result<ChatResponse>;

    /// Stream a chat completion, forwarding events as they arrive, and
    /// return the assembled response.
    ///
    /// Default implementation performs a blocking completion and replays it
    /// as a single text event.
    async fn chat_completion_stream(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ChatResponse> {
        let response = self.chat_completion(request).await?;
        if let Some(text) = response.content.as_ref().filter(|t| !t.is_empty()) {
            let _ = events.send(StreamEvent::Text(text.clone())).await;
        }
        for call in response.tool_calls() {
            let _ = events.send(StreamEvent::ToolCall(call.clone())).await;
        }
        let _ = events
            .send(StreamEvent::Done {
                finish_reason: response.finish_reason.clone(),
            })
            .await;
        Ok(response)
    }
}

/// Trait for embedding clients.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed each input text; output order matches input order.
    async fn embed(&self, model: String, inputs: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned;

    #[async_trait]
    impl LlmClient for Canned {
        async fn chat_completion(&self, _request: ChatRequest) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse::text("all at once"))
        }
    }

    #[tokio::test]
    async fn default_stream_replays_completion() {
        let (tx, mut rx) = mpsc::channel(8);
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: None,
            options: ChatOptions::default(),
        };
        let response = Canned.chat_completion_stream(request, tx).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("all at once"));
        assert_eq!(rx.recv().await, Some(StreamEvent::Text("all at once".into())));
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Done {
                finish_reason: Some("stop".into())
            })
        );
    }

    #[test]
    fn tool_call_arguments_tolerate_garbage() {
        let call = ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "f".into(),
                arguments: "not json".into(),
            },
        };
        assert_eq!(call.arguments(), serde_json::json!({}));
    }

    #[test]
    fn tool_message_serializes_call_id() {
        let msg = ChatMessage::tool_result("call_1", "42");
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
        assert!(wire.get("tool_calls").is_none());
    }
}
