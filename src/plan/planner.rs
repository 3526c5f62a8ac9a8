//! Turns a request plus the tool catalog into a validated, persisted plan.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Plan;
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, ChatOptions, GeneratorPool};
use crate::mcp::ToolInvoker;
use crate::store::{plan_id_for, PlanStore};
use crate::util::{extract_json, truncate_chars};

/// Sampling ceiling for plan generation.
const MAX_PLAN_TEMPERATURE: f64 = 0.3;

const PLANNER_INSTRUCTIONS: &str = r#"You are a planning engine. Break the user's request into an ordered list of tool calls.

Respond with strict JSON only, using exactly this shape:
{
  "goal": "short restatement of what the plan achieves",
  "steps": [
    {
      "step_number": 1,
      "tool": "tool name from the catalog",
      "arguments": {"param": "value"},
      "description": "what this step does",
      "expected_output": "what the step should return",
      "depends_on": []
    }
  ],
  "output_format": "how the final answer should be presented"
}

Rules:
- Number steps 1, 2, 3, ... with no gaps.
- depends_on may only list earlier step numbers.
- Use only tools from the catalog below.
- To use an earlier result, write ${step_N.field} inside an argument value."#;

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Clamped to 0.3.
    pub temperature: f64,
    pub max_tokens: u64,
    /// Where `<plan_id>.json` copies are written; `None` skips the file.
    pub plans_dir: Option<PathBuf>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 2000,
            plans_dir: None,
        }
    }
}

pub struct Planner {
    generator: Arc<GeneratorPool>,
    tools: Arc<dyn ToolInvoker>,
    store: PlanStore,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(
        generator: Arc<GeneratorPool>,
        tools: Arc<dyn ToolInvoker>,
        store: PlanStore,
        config: PlannerConfig,
    ) -> Self {
        Self {
            generator,
            tools,
            store,
            config,
        }
    }

    /// Generate, validate and persist a plan. Returns the plan id and plan.
    pub async fn create_plan(&self, request: &str) -> Result<(String, Plan)> {
        let plan = self.generate_plan(request).await?;
        let plan_id = persist_plan(&self.store, &plan, self.config.plans_dir.as_deref()).await?;
        info!(plan_id = %plan_id, steps = plan.steps.len(), "Plan created");
        Ok((plan_id, plan))
    }

    /// Generate and validate a plan without persisting it.
    pub async fn generate_plan(&self, request: &str) -> Result<Plan> {
        let catalog = self.tools.list_tools().await;
        let description = self.tools.tools_description().await;

        let messages = vec![
            ChatMessage::system(format!("{}\n\n{}", PLANNER_INSTRUCTIONS, description)),
            ChatMessage::user(format!("Request: {}", request)),
        ];
        let options = ChatOptions::with_temperature(self.config.temperature.min(MAX_PLAN_TEMPERATURE))
            .max_tokens(self.config.max_tokens);

        let response = self.generator.chat(messages, None, options, None).await?;
        let text = response.content.unwrap_or_default();
        debug!("Planner response: {}", truncate_chars(&text, 500));

        let mut plan = Plan::from_json(&extract_json(&text))?;
        plan.request = request.to_string();
        plan.validate(&catalog)?;
        Ok(plan)
    }
}

/// Store a plan under its content address, reusing the id when an identical
/// plan is already stored.
pub(crate) async fn persist_plan(store: &PlanStore, plan: &Plan, plans_dir: Option<&Path>) -> Result<String> {
    let plan_id = plan_id_for(plan)?;
    match store.get_plan_record(&plan_id).await {
        Ok(_) => {
            debug!(plan_id = %plan_id, "Reusing stored plan");
            return Ok(plan_id);
        }
        Err(Error::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let file_path = match plans_dir {
        Some(dir) => match write_plan_file(dir, &plan_id, plan).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(plan_id = %plan_id, "Failed to write plan file: {}", e);
                None
            }
        },
        None => None,
    };

    match store.save_plan(&plan_id, plan, file_path.as_deref()).await {
        // A concurrent planner stored the same plan first.
        Ok(()) | Err(Error::AlreadyExists(_)) => Ok(plan_id),
        Err(e) => Err(e),
    }
}

async fn write_plan_file(dir: &Path, plan_id: &str, plan: &Plan) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.json", plan_id));
    let content = serde_json::to_string_pretty(plan)?;
    tokio::fs::write(&path, content).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, ChatResponse, LlmClient, PoolStrategy, ProviderConfig};
    use crate::mcp::{ToolCallResult, ToolWrapper};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Scripted {
        reply: String,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LlmClient for Scripted {
        async fn chat_completion(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
            self.seen.lock().unwrap().push(request);
            Ok(ChatResponse::text(self.reply.clone()))
        }
    }

    struct MathTools;

    #[async_trait]
    impl ToolInvoker for MathTools {
        async fn list_tools(&self) -> Vec<ToolWrapper> {
            vec![ToolWrapper {
                name: "demo_math_add".into(),
                original_name: "math_add".into(),
                description: "Add two numbers".into(),
                server_name: "demo".into(),
                schema: json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}}),
            }]
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<ToolCallResult> {
            Ok(ToolCallResult::ok(json!({"sum": 5}), Duration::ZERO))
        }
    }

    fn planner(reply: &str, plans_dir: Option<PathBuf>) -> (Planner, Arc<Scripted>) {
        let client = Arc::new(Scripted {
            reply: reply.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let dyn_client: Arc<dyn LlmClient> = client.clone();
        let pool = GeneratorPool::new(
            PoolStrategy::RoundRobin,
            Duration::from_secs(5),
            vec![(ProviderConfig::new("scripted", "http://unused", "m"), dyn_client)],
        );
        let config = PlannerConfig {
            temperature: 0.9,
            plans_dir,
            ..Default::default()
        };
        let planner = Planner::new(
            Arc::new(pool),
            Arc::new(MathTools),
            PlanStore::in_memory().unwrap(),
            config,
        );
        (planner, client)
    }

    const SUM_PLAN: &str = r#"<think>one call is enough</think>
```json
{"goal": "sum 2 and 3",
 "steps": [{"step_number": 1, "tool": "math_add", "arguments": {"a": 2, "b": 3},
            "description": "add", "expected_output": "5", "depends_on": []}],
 "output_format": "number"}
```"#;

    #[tokio::test]
    async fn single_step_plan_is_parsed_and_saved() {
        let dir = TempDir::new().unwrap();
        let (planner, client) = planner(SUM_PLAN, Some(dir.path().join("plans")));

        let (plan_id, plan) = planner.create_plan("add 2 and 3").await.unwrap();
        assert_eq!(plan.goal, "sum 2 and 3");
        assert_eq!(plan.request, "add 2 and 3");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "math_add");
        assert_eq!(Value::Object(plan.steps[0].arguments.clone()), json!({"a": 2, "b": 3}));
        assert!(plan.steps[0].depends_on.is_empty());

        let record = planner.store.get_plan_record(&plan_id).await.unwrap();
        assert_eq!(record.execution_count, 0);
        let file = record.file_path.unwrap();
        assert!(file.ends_with(&format!("{}.json", plan_id)));
        assert!(Path::new(&file).exists());

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].options.temperature, Some(MAX_PLAN_TEMPERATURE));
        let system = seen[0].messages[0].content.as_deref().unwrap();
        assert!(system.contains("demo_math_add"));
    }

    #[tokio::test]
    async fn identical_plan_reuses_id() {
        let (planner, _) = planner(SUM_PLAN, None);
        let (first, _) = planner.create_plan("add 2 and 3").await.unwrap();
        let (second, _) = planner.create_plan("add 2 and 3").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(planner.store.list_plans(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_plan() {
        let reply = r#"{"goal":"g","steps":[{"step_number":1,"tool":"rm_rf","arguments":{}}],"output_format":""}"#;
        let (planner, _) = planner(reply, None);
        let err = planner.create_plan("wipe it").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn prose_reply_is_invalid_plan() {
        let (planner, _) = planner("I cannot help with that.", None);
        let err = planner.create_plan("anything").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));
    }
}
