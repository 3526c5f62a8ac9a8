//! OpenAI-compatible HTTP client (chat, streaming chat, embeddings) with
//! automatic retry for transient errors.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::error::{LlmError, RetryConfig};
use super::{
    ChatMessage, ChatRequest, ChatResponse, EmbeddingClient, FunctionCall, LlmClient, StreamEvent,
    TokenUsage, ToolCall, ToolDefinition,
};

/// Client for any endpoint speaking the OpenAI `/chat/completions` and
/// `/embeddings` dialect (Ollama, vLLM, llama.cpp server, OpenRouter, ...).
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry_config: RetryConfig,
}

impl OpenAiClient {
    /// Create a client with default retry configuration.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Send once; non-success statuses become classified errors.
    async fn send_once<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, LlmError> {
        let mut request = self
            .client
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::network_error(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                LlmError::network_error(format!("Connection failed: {}", e))
            } else {
                LlmError::network_error(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(LlmError::from_status(status.as_u16(), body, retry_after))
    }

    /// Send with automatic retry for transient errors.
    async fn send_with_retry<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, LlmError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let error = match self.send_once(path, body).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !self.retry_config.should_retry(&error, attempt) {
                if attempt > 0 {
                    tracing::error!("Request failed after {} retries: {}", attempt, error);
                } else {
                    tracing::debug!("Request failed (non-retryable): {}", error);
                }
                return Err(error);
            }

            let remaining = self
                .retry_config
                .max_retry_duration
                .saturating_sub(start.elapsed());
            let delay = error.suggested_delay(attempt).min(remaining);
            if delay.is_zero() {
                return Err(error);
            }

            tracing::warn!(
                "Retry attempt {} failed with {}, retrying in {:?}: {}",
                attempt + 1,
                error.kind,
                delay,
                error.message
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn wire_request(request: &ChatRequest, stream: bool) -> WireRequest<'_> {
        WireRequest {
            model: &request.model,
            messages: &request.messages,
            tools: request.tools.as_deref(),
            tool_choice: request.tools.as_ref().map(|_| "auto"),
            temperature: request.options.temperature,
            top_p: request.options.top_p,
            max_tokens: request.options.max_tokens,
            response_format: request
                .options
                .json_mode
                .then(|| serde_json::json!({"type": "json_object"})),
            stream,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        tracing::debug!(model = %request.model, "Sending chat completion");
        let response = self
            .send_with_retry("chat/completions", &Self::wire_request(&request, false))
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read body: {}", e)))?;

        let parsed: WireResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.filter(|c| !c.is_empty()),
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or(Some(request.model)),
        })
    }

    async fn chat_completion_stream(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ChatResponse> {
        tracing::debug!(model = %request.model, "Sending streaming chat completion");
        let response = self
            .send_with_retry("chat/completions", &Self::wire_request(&request, true))
            .await?;

        let mut bytes = Box::pin(response.bytes_stream());
        let mut buffer: Vec<u8> = Vec::new();
        let mut acc = StreamAccumulator::default();

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| LlmError::network_error(format!("Stream interrupted: {}", e)))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(&line) {
                    SseLine::Data(value) => {
                        for event in acc.push(&value) {
                            let _ = events.send(event).await;
                        }
                    }
                    SseLine::Done => break 'read,
                    SseLine::Skip => {}
                }
            }
        }

        let (response, tail) = acc.finish(&request.model);
        for event in tail {
            let _ = events.send(event).await;
        }
        Ok(response)
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiClient {
    async fn embed(&self, model: String, inputs: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let expected = inputs.len();
        let body = serde_json::json!({ "model": model, "input": inputs });
        let response = self.send_with_retry("embeddings", &body).await?;
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LlmError::parse_error(format!("Failed to parse embeddings: {}", e)))?;
        parsed.data.sort_by_key(|d| d.index);
        if parsed.data.len() != expected {
            return Err(LlmError::parse_error(format!(
                "expected {} embeddings, got {}",
                expected,
                parsed.data.len()
            ))
            .into());
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// One line of a server-sent event stream.
#[derive(Debug, PartialEq)]
enum SseLine {
    Data(Value),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str(payload) {
        Ok(value) => SseLine::Data(value),
        Err(e) => {
            tracing::debug!("Skipping malformed SSE payload: {}", e);
            SseLine::Skip
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles streamed deltas into text events and complete tool calls.
#[derive(Default)]
struct StreamAccumulator {
    content: String,
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    model: Option<String>,
}

impl StreamAccumulator {
    fn push(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            self.model.get_or_insert_with(|| model.to_string());
        }
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
            self.usage = Some(TokenUsage::new(prompt, completion));
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return events;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            return events;
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.content.push_str(text);
                events.push(StreamEvent::Text(text.to_string()));
            }
        }

        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let entry = self.calls.entry(index).or_default();
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                entry.id = id.to_string();
            }
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    entry.name.push_str(name);
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    entry.arguments.push_str(args);
                }
            }
        }
        events
    }

    fn finish(self, requested_model: &str) -> (ChatResponse, Vec<StreamEvent>) {
        let calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .map(|(index, call)| ToolCall {
                id: if call.id.is_empty() { format!("call_{}", index) } else { call.id },
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect();

        let mut events: Vec<StreamEvent> = calls.iter().cloned().map(StreamEvent::ToolCall).collect();
        events.push(StreamEvent::Done {
            finish_reason: self.finish_reason.clone(),
        });

        let response = ChatResponse {
            content: (!self.content.is_empty()).then_some(self.content),
            tool_calls: (!calls.is_empty()).then_some(calls),
            finish_reason: self.finish_reason,
            usage: self.usage,
            model: self.model.or_else(|| Some(requested_model.to_string())),
        };
        (response, events)
    }
}

/// Chat request on the wire.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
