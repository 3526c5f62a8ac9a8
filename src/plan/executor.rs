//! Sequential plan execution.
//!
//! Steps run strictly in step-number order, one at a time. Each step's
//! arguments are resolved against the results gathered so far, the tool is
//! invoked through the [`ToolInvoker`] with a per-step timeout, and the
//! execution record in the plan store is kept in sync.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::planner::persist_plan;
use super::template::substitute_arguments;
use super::{Plan, Step};
use crate::error::Result;
use crate::mcp::ToolInvoker;
use crate::store::PlanStore;

pub use crate::store::ExecutionStatus;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// What happened to one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step_number: u32,
    pub tool: String,
    /// Arguments after placeholder substitution.
    pub arguments: Value,
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    #[serde(skip)]
    pub duration: Duration,
}

/// Summary of one plan execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_id: i64,
    pub plan_id: String,
    pub status: ExecutionStatus,
    /// `step_N`, `last_result` and the tool name of each successful step.
    pub results: Map<String, Value>,
    pub steps: Vec<StepOutcome>,
    pub error: Option<String>,
    #[serde(skip)]
    pub duration: Duration,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn last_result(&self) -> Option<&Value> {
        self.results.get("last_result")
    }
}

pub struct Executor {
    tools: Arc<dyn ToolInvoker>,
    store: PlanStore,
    step_timeout: Duration,
}

impl Executor {
    pub fn new(tools: Arc<dyn ToolInvoker>, store: PlanStore) -> Self {
        Self {
            tools,
            store,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Load a stored plan and run it.
    pub async fn execute_plan_id(&self, plan_id: &str) -> Result<ExecutionReport> {
        let plan = self.store.get_plan(plan_id).await?;
        plan.validate_shape()?;
        self.execute(plan_id, &plan, &CancellationToken::new()).await
    }

    /// Persist an inline plan (reusing an identical stored one) and run it.
    pub async fn execute_inline(&self, plan: &Plan) -> Result<ExecutionReport> {
        plan.validate_shape()?;
        let plan_id = persist_plan(&self.store, plan, None).await?;
        self.execute(&plan_id, plan, &CancellationToken::new()).await
    }

    /// Run `plan` as an execution of `plan_id`.
    ///
    /// `Err` means the execution could not be recorded; a step failure is
    /// reported through the returned report's status. Cancellation is
    /// observed between steps; an in-flight tool call finishes under its own
    /// timeout.
    pub async fn execute(
        &self,
        plan_id: &str,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        let execution_id = self.store.record_execution(plan_id).await?;
        info!(plan_id = %plan_id, execution_id, steps = plan.steps.len(), "Executing plan");

        let mut results = Map::new();
        let mut outcomes = Vec::with_capacity(plan.steps.len());
        let mut failure = None;

        for step in &plan.steps {
            if cancel.is_cancelled() {
                failure = Some(format!("cancelled before step {}", step.step_number));
                break;
            }

            let outcome = self.run_step(step, &results).await;
            if outcome.success {
                results.insert(format!("step_{}", step.step_number), outcome.result.clone());
                results.insert("last_result".to_string(), outcome.result.clone());
                results.insert(step.tool.clone(), outcome.result.clone());
                outcomes.push(outcome);
            } else {
                let error = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("step {} failed", step.step_number));
                warn!(
                    plan_id = %plan_id,
                    step = step.step_number,
                    tool = %step.tool,
                    "Step failed: {}",
                    error
                );
                outcomes.push(outcome);
                failure = Some(error);
                break;
            }
        }

        let results_value = Value::Object(results.clone());
        self.store
            .complete_execution(execution_id, Some(&results_value), failure.as_deref())
            .await?;

        let status = if failure.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        info!(plan_id = %plan_id, execution_id, status = status.as_str(), "Execution finished");

        Ok(ExecutionReport {
            execution_id,
            plan_id: plan_id.to_string(),
            status,
            results,
            steps: outcomes,
            error: failure,
            duration: started.elapsed(),
        })
    }

    async fn run_step(&self, step: &Step, results: &Map<String, Value>) -> StepOutcome {
        let arguments = Value::Object(substitute_arguments(&step.arguments, results));
        let started = Instant::now();

        let call = self.tools.call_tool(&step.tool, arguments.clone());
        let (success, result, error) = match tokio::time::timeout(self.step_timeout, call).await {
            Ok(Ok(r)) if r.success => (true, r.data, None),
            Ok(Ok(r)) => (
                false,
                r.data,
                Some(r.error.unwrap_or_else(|| "tool reported failure".to_string())),
            ),
            Ok(Err(e)) => (false, Value::Null, Some(e.to_string())),
            Err(_) => (
                false,
                Value::Null,
                Some(format!(
                    "step {} timed out after {}s",
                    step.step_number,
                    self.step_timeout.as_secs_f64()
                )),
            ),
        };

        StepOutcome {
            step_number: step.step_number,
            tool: step.tool.clone(),
            arguments,
            success,
            result,
            error,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mcp::{ToolCallResult, ToolWrapper};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// In-process stand-in for the demo tool server.
    #[derive(Default)]
    struct DemoTools {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolInvoker for DemoTools {
        async fn list_tools(&self) -> Vec<ToolWrapper> {
            Vec::new()
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
            self.calls.lock().unwrap().push((name.to_string(), arguments.clone()));
            match name {
                "math_add" => {
                    let sum = arguments["a"].as_f64().unwrap_or(0.0) + arguments["b"].as_f64().unwrap_or(0.0);
                    Ok(ToolCallResult::ok(json!({ "sum": sum as i64 }), Duration::ZERO))
                }
                "echo" => Ok(ToolCallResult::ok(
                    json!({ "value": arguments["text"] }),
                    Duration::ZERO,
                )),
                "flaky" => Ok(ToolCallResult::failed("boom", Duration::ZERO)),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(ToolCallResult::ok(json!({}), Duration::ZERO))
                }
                other => Err(Error::ToolNotFound(other.to_string())),
            }
        }
    }

    fn plan(value: Value) -> Plan {
        serde_json::from_value(value).unwrap()
    }

    fn executor(tools: Arc<DemoTools>) -> Executor {
        Executor::new(tools, PlanStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn single_step_results_are_keyed_three_ways() {
        let exec = executor(Arc::new(DemoTools::default()));
        let p = plan(json!({
            "request": "add 2 and 3", "goal": "sum 2 and 3", "output_format": "number",
            "steps": [{"step_number": 1, "tool": "math_add", "arguments": {"a": 2, "b": 3}, "depends_on": []}]
        }));

        let report = exec.execute_inline(&p).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.results["step_1"], json!({"sum": 5}));
        assert_eq!(report.results["last_result"], json!({"sum": 5}));
        assert_eq!(report.results["math_add"], json!({"sum": 5}));

        let record = exec.store.get_plan_record(&report.plan_id).await.unwrap();
        assert_eq!(record.execution_count, 1);
        assert_eq!(record.status, "completed");
    }

    #[tokio::test]
    async fn dependent_chain_threads_results() {
        let tools = Arc::new(DemoTools::default());
        let exec = executor(tools.clone());
        let p = plan(json!({
            "goal": "greet",
            "steps": [
                {"step_number": 1, "tool": "echo", "arguments": {"text": "hello"}},
                {"step_number": 2, "tool": "echo", "arguments": {"text": "${step_1.value}, world"}, "depends_on": [1]}
            ]
        }));

        let report = exec.execute_inline(&p).await.unwrap();
        assert_eq!(report.results["step_2"], json!({"value": "hello, world"}));
        let calls = tools.calls.lock().unwrap();
        assert_eq!(calls[1].1, json!({"text": "hello, world"}));
    }

    #[tokio::test]
    async fn tool_failure_aborts_and_marks_plan_failed() {
        let exec = executor(Arc::new(DemoTools::default()));
        let p = plan(json!({
            "goal": "fail",
            "steps": [
                {"step_number": 1, "tool": "flaky", "arguments": {}},
                {"step_number": 2, "tool": "echo", "arguments": {"text": "never"}}
            ]
        }));

        let report = exec.execute_inline(&p).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("boom"));
        assert!(!report.results.contains_key("step_1"));
        assert_eq!(report.steps.len(), 1);

        let record = exec.store.get_plan_record(&report.plan_id).await.unwrap();
        assert_eq!(record.status, "failed");
        let history = exec.store.get_execution_history(&report.plan_id).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Failed);
        assert_eq!(history[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_tool_fails_the_step() {
        let exec = executor(Arc::new(DemoTools::default()));
        let p = plan(json!({"goal": "g", "steps": [{"step_number": 1, "tool": "nope", "arguments": {}}]}));
        let report = exec.execute_inline(&p).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.error.unwrap().contains("tool not found"));
    }

    #[tokio::test]
    async fn step_timeout_fails_the_step() {
        let exec = executor(Arc::new(DemoTools::default())).with_step_timeout(Duration::from_millis(100));
        let p = plan(json!({"goal": "g", "steps": [{"step_number": 1, "tool": "slow", "arguments": {}}]}));
        let report = exec.execute_inline(&p).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_step() {
        let tools = Arc::new(DemoTools::default());
        let exec = executor(tools.clone());
        let p = plan(json!({"goal": "g", "steps": [{"step_number": 1, "tool": "echo", "arguments": {"text": "x"}}]}));
        let plan_id = persist_plan(&exec.store, &p, None).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let report = exec.execute(&plan_id, &p, &token).await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(tools.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_by_id_loads_stored_plan() {
        let exec = executor(Arc::new(DemoTools::default()));
        let p = plan(json!({"goal": "g", "steps": [{"step_number": 1, "tool": "echo", "arguments": {"text": "x"}}]}));
        let plan_id = persist_plan(&exec.store, &p, None).await.unwrap();

        let report = exec.execute_plan_id(&plan_id).await.unwrap();
        assert_eq!(report.results["echo"], json!({"value": "x"}));
        assert!(matches!(exec.execute_plan_id("missing").await, Err(Error::NotFound(_))));
    }
}
