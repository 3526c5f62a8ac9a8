//! Agent façade: one entry point that turns a request into an answer.
//!
//! # Flow of [`Agent::run`]
//! 1. Retrieve context for the request (optional; failures mean no context)
//! 2. Recognize intent (failure falls back to "needs tools")
//! 3. Merge the context into an enhanced request (failure keeps the original)
//! 4. Decide whether a tool plan is needed; if not, answer directly
//! 5. Plan, execute, and synthesize a final answer from the results

mod context;
mod pool;
mod retrieval;
mod types;

pub use context::AgentContext;
pub use pool::{AgentPool, PooledAgent};
pub use retrieval::{cosine_similarity, ContextRetriever, EmbeddingRetriever, RetrievedChunk};
pub use types::{AgentId, DoResult};

use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::llm::{ChatMessage, ChatOptions, IntentResult};
use crate::plan::{Executor, Planner};
use crate::util::{extract_json, truncate_chars};

const SYNTHESIZE_REQUEST_PROMPT: &str = "Rewrite the request so it is self-contained, folding in \
any facts from the context that the request depends on. Reply with the rewritten request only.";

const DECISION_PROMPT: &str = "Decide whether answering the request requires calling any of the \
tools listed below. Reply with JSON only: {\"needs_tools\": true|false, \"answer\": \"the complete \
answer when no tools are needed, otherwise empty\"}";

const FINAL_ANSWER_PROMPT: &str = "Write the final answer to the user's request using the tool \
results provided. Be direct and concise; do not mention plans or steps.";

/// Results larger than this are truncated before going into a prompt.
const MAX_RESULTS_CHARS: usize = 8000;

/// A planner, executor and generator bundled behind a single `run`.
pub struct Agent {
    id: AgentId,
    ctx: AgentContext,
    planner: Planner,
    executor: Executor,
}

impl Agent {
    pub fn new(ctx: AgentContext) -> Self {
        let planner = Planner::new(
            ctx.generator.clone(),
            ctx.tools.clone(),
            ctx.plan_store.clone(),
            ctx.planner_config(),
        );
        let executor = Executor::new(ctx.tools.clone(), ctx.plan_store.clone())
            .with_step_timeout(ctx.step_timeout);
        Self {
            id: AgentId::new(),
            ctx,
            planner,
            executor,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Answer `request`, planning and running tools when needed.
    pub async fn run(&self, request: &str) -> DoResult {
        self.run_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`Agent::run`]; `cancel` stops plan execution between steps.
    pub async fn run_with_cancel(&self, request: &str, cancel: &CancellationToken) -> DoResult {
        let started = Instant::now();
        info!(agent = %self.id, "Handling request: {}", truncate_chars(request, 120));

        let context = self.retrieve_context(request).await;
        let intent = match self.ctx.generator.recognize_intent(request).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(agent = %self.id, "Intent recognition failed: {}", e);
                IntentResult::fallback()
            }
        };

        let mut result = DoResult::new(request, intent);
        result.context = context;
        result.enhanced_request = self.enhance_request(request, result.context.as_deref()).await;

        let decision = self.decide(&result.enhanced_request, &intent).await;
        if !decision.needs_tools {
            match self.direct_answer(&result.enhanced_request, decision.answer).await {
                Ok(answer) => {
                    result.direct_answer = Some(answer);
                    result.success = true;
                }
                Err(e) => result.errors.push(e.to_string()),
            }
            result.duration = started.elapsed();
            return result;
        }

        result.used_tools = true;
        if let Err(e) = self.plan_and_execute(&mut result, cancel).await {
            warn!(agent = %self.id, "Tool path failed: {}", e);
            result.errors.push(e.to_string());
        }
        result.duration = started.elapsed();
        info!(
            agent = %self.id,
            success = result.success,
            elapsed_ms = result.duration.as_millis() as u64,
            "Request finished"
        );
        result
    }

    async fn retrieve_context(&self, request: &str) -> Option<String> {
        let retriever = self.ctx.retriever.as_ref()?;
        match retriever.relevant_context(request, self.ctx.top_k).await {
            Ok(context) if !context.trim().is_empty() => Some(context),
            Ok(_) => None,
            Err(e) => {
                warn!(agent = %self.id, "Retrieval failed, continuing without context: {}", e);
                None
            }
        }
    }

    /// Without context there is nothing to merge and the request is used as is.
    async fn enhance_request(&self, request: &str, context: Option<&str>) -> String {
        let Some(context) = context else {
            return request.to_string();
        };
        let messages = vec![
            ChatMessage::system(SYNTHESIZE_REQUEST_PROMPT),
            ChatMessage::user(format!("Context:\n{}\n\nRequest: {}", context, request)),
        ];
        let options = ChatOptions::with_temperature(0.2).max_tokens(500);
        match self.ctx.generator.chat(messages, None, options, None).await {
            Ok(response) => {
                let text = crate::util::strip_think_tags(&response.content.unwrap_or_default());
                if text.is_empty() {
                    request.to_string()
                } else {
                    text
                }
            }
            Err(e) => {
                debug!(agent = %self.id, "Request synthesis failed: {}", e);
                request.to_string()
            }
        }
    }

    async fn decide(&self, request: &str, intent: &IntentResult) -> Decision {
        let fallback = Decision {
            needs_tools: intent.needs_tools,
            answer: None,
        };
        let catalog = self.ctx.tools.tools_description().await;
        let messages = vec![
            ChatMessage::system(format!("{}\n\n{}", DECISION_PROMPT, catalog)),
            ChatMessage::user(request),
        ];
        let options = ChatOptions::with_temperature(0.0).max_tokens(1000).json();
        let text = match self.ctx.generator.chat(messages, None, options, None).await {
            Ok(response) => response.content.unwrap_or_default(),
            Err(e) => {
                debug!(agent = %self.id, "Tool decision failed: {}", e);
                return fallback;
            }
        };
        Decision::parse(&text).unwrap_or(fallback)
    }

    async fn direct_answer(&self, request: &str, answer: Option<String>) -> Result<String> {
        if let Some(answer) = answer.filter(|a| !a.trim().is_empty()) {
            return Ok(answer);
        }
        let text = self
            .ctx
            .generator
            .generate(request, ChatOptions::with_temperature(0.7))
            .await?;
        Ok(crate::util::strip_think_tags(&text))
    }

    async fn plan_and_execute(&self, result: &mut DoResult, cancel: &CancellationToken) -> Result<()> {
        let (plan_id, plan) = self.planner.create_plan(&result.enhanced_request).await?;
        result.plan_id = Some(plan_id.clone());
        result.plan = Some(plan.clone());

        let report = self.executor.execute(&plan_id, &plan, cancel).await?;
        let succeeded = report.succeeded();
        if let Some(error) = &report.error {
            result.errors.push(error.clone());
        }
        let results = Value::Object(report.results.clone());
        result.execution = Some(report);
        if !succeeded {
            return Ok(());
        }
        result.success = true;

        let results_text = truncate_chars(&serde_json::to_string_pretty(&results)?, MAX_RESULTS_CHARS);
        let mut prompt = format!("Request: {}\n\n", result.request);
        if let Some(context) = &result.context {
            prompt.push_str(&format!("Context:\n{}\n\n", context));
        }
        prompt.push_str(&format!("Tool results:\n{}", results_text));

        let messages = vec![ChatMessage::system(FINAL_ANSWER_PROMPT), ChatMessage::user(prompt)];
        match self
            .ctx
            .generator
            .chat(messages, None, ChatOptions::with_temperature(0.3), None)
            .await
        {
            Ok(response) => {
                result.final_answer = Some(crate::util::strip_think_tags(
                    &response.content.unwrap_or_default(),
                ));
            }
            Err(e) => result.errors.push(format!("answer synthesis failed: {}", e)),
        }
        Ok(())
    }
}

/// Outcome of the "are tools needed" question.
#[derive(Debug, Clone, PartialEq)]
struct Decision {
    needs_tools: bool,
    answer: Option<String>,
}

impl Decision {
    fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(&extract_json(text)).ok()?;
        let needs_tools = value.get("needs_tools")?.as_bool()?;
        let answer = value
            .get("answer")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|a| !a.is_empty());
        Some(Self { needs_tools, answer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Intent;
    use crate::store::PlanStore;
    use crate::testutil::{agent_reply, generator, system_prompt, DemoTools, ScriptedLlm};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct FixedContext(&'static str);

    #[async_trait]
    impl ContextRetriever for FixedContext {
        async fn relevant_context(&self, _query: &str, _top_k: usize) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct BrokenRetriever;

    #[async_trait]
    impl ContextRetriever for BrokenRetriever {
        async fn relevant_context(&self, _query: &str, _top_k: usize) -> Result<String> {
            Err(crate::error::Error::Internal("index offline".into()))
        }
    }

    fn ctx(llm: Arc<ScriptedLlm>, tools: Arc<DemoTools>) -> AgentContext {
        AgentContext::new(generator(llm), tools, PlanStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn tool_path_runs_plan_and_synthesizes_answer() {
        let tools = DemoTools::new();
        let llm = ScriptedLlm::new(|r| agent_reply(r).unwrap_or_default());
        let agent = Agent::new(ctx(llm, tools.clone()));

        let result = agent.run("add 2 and 3").await;
        assert!(result.success, "errors: {:?}", result.errors);
        assert!(result.used_tools);
        assert_eq!(result.intent.intent, Intent::Calculation);
        assert_eq!(result.answer(), Some("The sum is 5."));
        let execution = result.execution.as_ref().unwrap();
        assert_eq!(execution.results["math_add"], json!({"sum": 5}));
        assert_eq!(result.tool_calls(), 1);
        assert_eq!(tools.call_count(), 1);
    }

    #[tokio::test]
    async fn direct_answer_skips_tools() {
        let tools = DemoTools::new();
        let llm = ScriptedLlm::new(|r| {
            if system_prompt(r).contains("Decide whether") {
                r#"{"needs_tools": false, "answer": "Hello there!"}"#.to_string()
            } else {
                agent_reply(r).unwrap_or_default()
            }
        });
        let agent = Agent::new(ctx(llm, tools.clone()));

        let result = agent.run("hi").await;
        assert!(result.success);
        assert!(!result.used_tools);
        assert_eq!(result.direct_answer.as_deref(), Some("Hello there!"));
        assert!(result.plan_id.is_none());
        assert_eq!(tools.call_count(), 0);
    }

    #[tokio::test]
    async fn garbage_intent_and_decision_fall_back_to_tools() {
        let llm = ScriptedLlm::new(|r| {
            let system = system_prompt(r);
            if system.contains("Classify") || system.contains("Decide whether") {
                "no idea".to_string()
            } else {
                agent_reply(r).unwrap_or_default()
            }
        });
        let agent = Agent::new(ctx(llm, DemoTools::new()));

        let result = agent.run("add 2 and 3").await;
        assert_eq!(result.intent, IntentResult::fallback());
        assert!(result.used_tools);
        assert!(result.success);
    }

    #[tokio::test]
    async fn context_is_merged_into_request() {
        let llm = ScriptedLlm::new(|r| agent_reply(r).unwrap_or_default());
        let agent = Agent::new(ctx(llm, DemoTools::new()).with_retriever(Arc::new(FixedContext("a=2, b=3"))));

        let result = agent.run("add them").await;
        assert_eq!(result.context.as_deref(), Some("a=2, b=3"));
        assert!(result.enhanced_request.ends_with("(with context)"));
        assert!(result.success);
    }

    #[tokio::test]
    async fn retrieval_failure_degrades_to_no_context() {
        let llm = ScriptedLlm::new(|r| agent_reply(r).unwrap_or_default());
        let agent = Agent::new(ctx(llm, DemoTools::new()).with_retriever(Arc::new(BrokenRetriever)));

        let result = agent.run("add 2 and 3").await;
        assert!(result.context.is_none());
        assert_eq!(result.enhanced_request, "add 2 and 3");
        assert!(result.success);
    }

    #[tokio::test]
    async fn failing_tool_marks_result_failed() {
        let llm = ScriptedLlm::new(|r| {
            if system_prompt(r).contains("planning engine") {
                r#"{"goal":"fail","steps":[{"step_number":1,"tool":"flaky","arguments":{}}],"output_format":""}"#.to_string()
            } else {
                agent_reply(r).unwrap_or_default()
            }
        });
        let agent = Agent::new(ctx(llm, DemoTools::new()));

        let result = agent.run("try the flaky thing").await;
        assert!(!result.success);
        assert_eq!(result.error(), Some("boom"));
        assert!(result.final_answer.is_none());
    }

    #[test]
    fn decision_parsing() {
        assert_eq!(
            Decision::parse("```json\n{\"needs_tools\": false, \"answer\": \"4\"}\n```"),
            Some(Decision {
                needs_tools: false,
                answer: Some("4".into())
            })
        );
        assert_eq!(
            Decision::parse(r#"{"needs_tools": true, "answer": ""}"#).unwrap().answer,
            None
        );
        assert!(Decision::parse(r#"{"answer": "x"}"#).is_none());
    }
}
