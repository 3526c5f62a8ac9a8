//! Load-balanced pools of generator and embedding endpoints.
//!
//! # Invariants
//! - A provider's in-flight count never exceeds its `max_concurrency`.
//! - Every checkout is released exactly once: the [`Lease`] guard releases
//!   on drop, on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    ChatMessage, ChatOptions, ChatRequest, ChatResponse, EmbeddingClient, LlmClient, OpenAiClient,
    StreamEvent, ToolDefinition,
};
use crate::error::{Error, Result};
use crate::util::extract_json;

/// How the pool picks among providers with spare capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Lowest in-flight / max_concurrency ratio first
    LeastLoad,
    /// Highest capability first, among those meeting the requested minimum
    CapabilityRequired,
}

fn default_capability() -> u8 {
    3
}

fn default_max_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_acquire_timeout_secs() -> u64 {
    300
}

/// A named model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model_name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// 1 (weakest) to 5 (strongest)
    #[serde(default = "default_capability")]
    pub capability: u8,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            model_name: model_name.into(),
            api_key: None,
            capability: default_capability(),
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Clamp capability to 1..=5 and concurrency to at least 1.
    fn normalized(mut self) -> Self {
        self.capability = self.capability.clamp(1, 5);
        self.max_concurrency = self.max_concurrency.max(1);
        self
    }
}

/// Pool settings plus the generator and embedder endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub strategy: PoolStrategy,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub embedders: Vec<ProviderConfig>,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.max(1))
    }
}

/// Polled view of one provider.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProviderStatus {
    pub healthy: bool,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub last_error: Option<String>,
}

struct PooledProvider<C: ?Sized> {
    config: ProviderConfig,
    client: Arc<C>,
    in_flight: AtomicUsize,
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl<C: ?Sized> PooledProvider<C> {
    fn try_reserve(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.config.max_concurrency {
                return false;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn load(&self) -> f64 {
        self.in_flight.load(Ordering::SeqCst) as f64 / self.config.max_concurrency as f64
    }
}

/// A pool of clients sharing one checkout protocol.
pub struct ClientPool<C: ?Sized> {
    providers: Vec<PooledProvider<C>>,
    strategy: PoolStrategy,
    cursor: AtomicUsize,
    released: Notify,
    acquire_timeout: Duration,
}

/// Pool of chat-completion endpoints.
pub type GeneratorPool = ClientPool<dyn LlmClient>;

/// Pool of embedding endpoints.
pub type EmbedderPool = ClientPool<dyn EmbeddingClient>;

/// A checked-out client; releases its slot on drop.
pub struct Lease<'a, C: ?Sized> {
    pool: &'a ClientPool<C>,
    index: usize,
}

impl<C: ?Sized> Lease<'_, C> {
    pub fn client(&self) -> &C {
        &self.pool.providers[self.index].client
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.pool.providers[self.index].config
    }

    fn record<T>(&self, result: &anyhow::Result<T>) {
        let provider = &self.pool.providers[self.index];
        match result {
            Ok(_) => provider.healthy.store(true, Ordering::SeqCst),
            Err(e) => {
                provider.healthy.store(false, Ordering::SeqCst);
                if let Ok(mut last) = provider.last_error.lock() {
                    *last = Some(format!("{:#}", e));
                }
            }
        }
    }
}

impl<C: ?Sized> std::fmt::Debug for Lease<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("provider", &self.pool.providers[self.index].config.name)
            .finish()
    }
}

impl<C: ?Sized> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        self.pool.providers[self.index]
            .in_flight
            .fetch_sub(1, Ordering::SeqCst);
        self.pool.released.notify_waiters();
    }
}

impl<C: ?Sized> ClientPool<C> {
    pub fn new(
        strategy: PoolStrategy,
        acquire_timeout: Duration,
        providers: Vec<(ProviderConfig, Arc<C>)>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|(config, client)| PooledProvider {
                config: config.normalized(),
                client,
                in_flight: AtomicUsize::new(0),
                healthy: AtomicBool::new(true),
                last_error: Mutex::new(None),
            })
            .collect();
        Self {
            providers,
            strategy,
            cursor: AtomicUsize::new(0),
            released: Notify::new(),
            acquire_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Candidate indices in preference order.
    fn candidates(&self, min_capability: u8) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.providers.len())
            .filter(|&i| self.providers[i].config.capability >= min_capability)
            .collect();
        if order.is_empty() {
            return order;
        }

        match self.strategy {
            PoolStrategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::SeqCst) % order.len();
                order.rotate_left(start);
            }
            PoolStrategy::Random => order.shuffle(&mut rand::thread_rng()),
            PoolStrategy::LeastLoad => order.sort_by(|&a, &b| {
                self.providers[a]
                    .load()
                    .partial_cmp(&self.providers[b].load())
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            PoolStrategy::CapabilityRequired => order.sort_by(|&a, &b| {
                let (pa, pb) = (&self.providers[a], &self.providers[b]);
                pb.config
                    .capability
                    .cmp(&pa.config.capability)
                    .then(pa.load().partial_cmp(&pb.load()).unwrap_or(std::cmp::Ordering::Equal))
            }),
        }

        // Healthy providers first; unhealthy ones remain a last resort.
        order.sort_by_key(|&i| !self.providers[i].healthy.load(Ordering::SeqCst));
        order
    }

    fn try_acquire(&self, min_capability: u8) -> Option<usize> {
        self.candidates(min_capability)
            .into_iter()
            .find(|&i| self.providers[i].try_reserve())
    }

    /// Check out a client with at least `min_capability`, waiting while all
    /// suitable clients are saturated.
    pub async fn acquire(&self, min_capability: Option<u8>) -> Result<Lease<'_, C>> {
        let min_capability = min_capability.unwrap_or(1);
        if !self
            .providers
            .iter()
            .any(|p| p.config.capability >= min_capability)
        {
            return Err(Error::Llm(format!(
                "no provider with capability >= {} is configured",
                min_capability
            )));
        }

        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(index) = self.try_acquire(min_capability) {
                debug!(provider = %self.providers[index].config.name, "Checked out client");
                return Ok(Lease { pool: self, index });
            }

            tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "no client became available within {:?}",
                        self.acquire_timeout
                    ))
                })?;
        }
    }

    /// Provider name → status.
    pub fn get_status(&self) -> HashMap<String, ProviderStatus> {
        self.providers
            .iter()
            .map(|p| {
                (
                    p.config.name.clone(),
                    ProviderStatus {
                        healthy: p.healthy.load(Ordering::SeqCst),
                        in_flight: p.in_flight.load(Ordering::SeqCst),
                        max_concurrency: p.config.max_concurrency,
                        last_error: p.last_error.lock().ok().and_then(|e| e.clone()),
                    },
                )
            })
            .collect()
    }
}

fn llm_error(provider: &str, e: anyhow::Error) -> Error {
    Error::Llm(format!("{}: {:#}", provider, e))
}

impl GeneratorPool {
    /// Build a pool of OpenAI-compatible clients.
    pub fn from_config(config: &PoolConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|p| {
                let client: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
                    p.base_url.clone(),
                    p.api_key.clone(),
                    Duration::from_secs(p.timeout_secs),
                ));
                (p.clone(), client)
            })
            .collect();
        Self::new(config.strategy, config.acquire_timeout(), providers)
    }

    fn request(lease: &Lease<'_, dyn LlmClient>, messages: Vec<ChatMessage>, tools: Option<Vec<ToolDefinition>>, options: ChatOptions) -> ChatRequest {
        ChatRequest {
            model: lease.config().model_name.clone(),
            messages,
            tools,
            options,
        }
    }

    /// Run a chat completion on a checked-out client.
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
        options: ChatOptions,
        min_capability: Option<u8>,
    ) -> Result<ChatResponse> {
        let lease = self.acquire(min_capability).await?;
        let request = Self::request(&lease, messages, tools, options);
        let result = lease.client().chat_completion(request).await;
        lease.record(&result);
        result.map_err(|e| llm_error(&lease.config().name, e))
    }

    /// Single-prompt completion returning the text.
    pub async fn generate(&self, prompt: &str, options: ChatOptions) -> Result<String> {
        let response = self
            .chat(vec![ChatMessage::user(prompt)], None, options, None)
            .await?;
        Ok(response.content.unwrap_or_default())
    }

    /// Stream a single-prompt completion; `on_chunk` sees each text chunk in
    /// emission order. Returns the full text.
    pub async fn stream<F>(&self, prompt: &str, options: ChatOptions, mut on_chunk: F) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let response = self
            .stream_with_tools(vec![ChatMessage::user(prompt)], None, options, |event| {
                if let StreamEvent::Text(text) = event {
                    on_chunk(&text);
                }
            })
            .await?;
        Ok(response.content.unwrap_or_default())
    }

    /// Completion with function calling; the response carries content and
    /// tool calls.
    pub async fn generate_with_tools(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        options: ChatOptions,
    ) -> Result<ChatResponse> {
        let tools = (!tools.is_empty()).then_some(tools);
        self.chat(messages, tools, options, None).await
    }

    /// Streaming completion with function calling; `on_event` receives typed
    /// events in order.
    pub async fn stream_with_tools<F>(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
        options: ChatOptions,
        mut on_event: F,
    ) -> Result<ChatResponse>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let lease = self.acquire(None).await?;
        let request = Self::request(&lease, messages, tools.filter(|t| !t.is_empty()), options);
        let (tx, mut rx) = mpsc::channel(64);

        let call = lease.client().chat_completion_stream(request, tx);
        let drain = async {
            while let Some(event) = rx.recv().await {
                on_event(event);
            }
        };
        let (result, ()) = tokio::join!(call, drain);
        lease.record(&result);
        result.map_err(|e| llm_error(&lease.config().name, e))
    }

    /// Completion whose output must be JSON matching `schema`, decoded to `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        schema: &Value,
        options: ChatOptions,
    ) -> Result<T> {
        let schema_text = serde_json::to_string_pretty(schema)?;
        let messages = vec![
            ChatMessage::system(format!(
                "Respond with a single JSON value that conforms to this JSON schema. \
                 Output only the JSON.\n\n{}",
                schema_text
            )),
            ChatMessage::user(prompt),
        ];
        let response = self.chat(messages, None, options.json(), None).await?;
        let text = response.content.unwrap_or_default();
        let json = extract_json(&text);
        serde_json::from_str(&json).map_err(|e| {
            warn!("Structured output did not parse: {}", e);
            Error::Llm(format!("structured output did not match the requested shape: {}", e))
        })
    }
}

impl EmbedderPool {
    /// Build a pool of OpenAI-compatible embedding clients.
    pub fn from_config(config: &PoolConfig) -> Self {
        let providers = config
            .embedders
            .iter()
            .map(|p| {
                let client: Arc<dyn EmbeddingClient> = Arc::new(OpenAiClient::new(
                    p.base_url.clone(),
                    p.api_key.clone(),
                    Duration::from_secs(p.timeout_secs),
                ));
                (p.clone(), client)
            })
            .collect();
        Self::new(config.strategy, config.acquire_timeout(), providers)
    }

    /// Embed a batch of texts; output order matches input order.
    pub async fn embed_multiple(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let lease = self.acquire(None).await?;
        let model = lease.config().model_name.clone();
        let result = lease.client().embed(model, texts).await;
        lease.record(&result);
        result.map_err(|e| llm_error(&lease.config().name, e))
    }

    /// Embed one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_multiple(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Llm("embedding endpoint returned no vectors".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use tokio_test::{assert_pending, assert_ready};

    mock! {
        pub Llm {}

        #[async_trait]
        impl LlmClient for Llm {
            async fn chat_completion(&self, request: ChatRequest) -> anyhow::Result<ChatResponse>;
        }
    }

    fn provider(name: &str, capability: u8, max_concurrency: usize) -> ProviderConfig {
        ProviderConfig {
            capability,
            max_concurrency,
            ..ProviderConfig::new(name, "http://unused", format!("{}-model", name))
        }
    }

    fn pool_of(strategy: PoolStrategy, entries: Vec<(ProviderConfig, Arc<dyn LlmClient>)>) -> GeneratorPool {
        GeneratorPool::new(strategy, Duration::from_secs(5), entries)
    }

    fn single(mock: MockLlm) -> GeneratorPool {
        let client: Arc<dyn LlmClient> = Arc::new(mock);
        pool_of(PoolStrategy::RoundRobin, vec![(provider("alpha", 3, 1), client)])
    }

    /// Counts concurrent calls and sleeps to keep them overlapping.
    struct Slow {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for Slow {
        async fn chat_completion(&self, _request: ChatRequest) -> anyhow::Result<ChatResponse> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ChatResponse::text("ok"))
        }
    }

    #[tokio::test]
    async fn generate_sends_provider_model() {
        let mut mock = MockLlm::new();
        mock.expect_chat_completion()
            .times(1)
            .withf(|req: &ChatRequest| req.model == "alpha-model" && req.options.temperature == Some(0.1))
            .returning(|_| Ok(ChatResponse::text("hello")));

        let pool = single(mock);
        let text = pool.generate("hi", ChatOptions::with_temperature(0.1)).await.unwrap();
        assert_eq!(text, "hello");
        assert_eq!(pool.get_status()["alpha"].in_flight, 0);
    }

    #[tokio::test]
    async fn failures_release_and_mark_unhealthy() {
        let mut mock = MockLlm::new();
        mock.expect_chat_completion()
            .returning(|_| Err(anyhow::anyhow!("connection refused")));

        let pool = single(mock);
        let err = pool.generate("hi", ChatOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Llm(msg) if msg.contains("connection refused")));

        let status = &pool.get_status()["alpha"];
        assert!(!status.healthy);
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.last_error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn concurrency_cap_holds_under_load() {
        let slow = Arc::new(Slow {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let client: Arc<dyn LlmClient> = slow.clone();
        let pool = Arc::new(pool_of(PoolStrategy::LeastLoad, vec![(provider("alpha", 3, 2), client)]));

        let calls = (0..20).map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.generate("x", ChatOptions::default()).await })
        });
        for call in futures::future::join_all(calls).await {
            assert_eq!(call.unwrap().unwrap(), "ok");
        }

        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.get_status()["alpha"].in_flight, 0);
    }

    #[tokio::test]
    async fn saturated_pool_blocks_until_release() {
        let client: Arc<dyn LlmClient> = Arc::new(MockLlm::new());
        let pool = pool_of(PoolStrategy::RoundRobin, vec![(provider("alpha", 3, 1), client)]);

        let lease = pool.acquire(None).await.unwrap();
        let mut waiter = tokio_test::task::spawn(pool.acquire(None));
        assert_pending!(waiter.poll());

        drop(lease);
        assert!(waiter.is_woken());
        let second = assert_ready!(waiter.poll()).unwrap();
        assert_eq!(second.config().name, "alpha");
    }

    #[tokio::test]
    async fn capability_filter_and_ordering() {
        let weak: Arc<dyn LlmClient> = Arc::new(MockLlm::new());
        let strong: Arc<dyn LlmClient> = Arc::new(MockLlm::new());
        let pool = pool_of(
            PoolStrategy::CapabilityRequired,
            vec![(provider("weak", 2, 1), weak), (provider("strong", 5, 1), strong)],
        );

        let first = pool.acquire(None).await.unwrap();
        assert_eq!(first.config().name, "strong");
        let second = pool.acquire(None).await.unwrap();
        assert_eq!(second.config().name, "weak");
        drop((first, second));

        let only_strong = pool.acquire(Some(4)).await.unwrap();
        assert_eq!(only_strong.config().name, "strong");
        assert!(matches!(pool.acquire(Some(6)).await, Err(Error::Llm(_))));
    }

    #[tokio::test]
    async fn round_robin_rotates() {
        let a: Arc<dyn LlmClient> = Arc::new(MockLlm::new());
        let b: Arc<dyn LlmClient> = Arc::new(MockLlm::new());
        let pool = pool_of(PoolStrategy::RoundRobin, vec![(provider("a", 3, 4), a), (provider("b", 3, 4), b)]);
        let names: Vec<String> = {
            let mut names = Vec::new();
            for _ in 0..4 {
                let lease = pool.acquire(None).await.unwrap();
                names.push(lease.config().name.clone());
            }
            names
        };
        assert_eq!(names, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn stream_delivers_chunks_in_order() {
        let mut mock = MockLlm::new();
        mock.expect_chat_completion()
            .returning(|_| Ok(ChatResponse::text("whole answer")));
        let pool = single(mock);

        let mut seen = Vec::new();
        let text = pool
            .stream("q", ChatOptions::default(), |chunk| seen.push(chunk.to_string()))
            .await
            .unwrap();
        assert_eq!(text, "whole answer");
        assert_eq!(seen, vec!["whole answer".to_string()]);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        ok: bool,
    }

    #[tokio::test]
    async fn structured_output_is_decoded() {
        let mut mock = MockLlm::new();
        mock.expect_chat_completion()
            .withf(|req: &ChatRequest| req.options.json_mode)
            .returning(|_| Ok(ChatResponse::text("```json\n{\"ok\": true}\n```")));
        let pool = single(mock);

        let schema = serde_json::json!({"type": "object", "properties": {"ok": {"type": "boolean"}}});
        let verdict: Verdict = pool
            .generate_structured("is it ok?", &schema, ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict { ok: true });
    }

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingClient for FixedEmbedder {
        async fn embed(&self, _model: String, inputs: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn embedder_pool_preserves_order() {
        let client: Arc<dyn EmbeddingClient> = Arc::new(FixedEmbedder);
        let pool = EmbedderPool::new(
            PoolStrategy::RoundRobin,
            Duration::from_secs(1),
            vec![(provider("embed", 3, 1), client)],
        );
        let vectors = pool
            .embed_multiple(vec!["a".into(), "abc".into()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![3.0, 1.0]]);
        assert_eq!(pool.embed("ab").await.unwrap(), vec![2.0, 1.0]);
    }
}
