//! Core types for the agent façade.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::llm::IntentResult;
use crate::plan::{ExecutionReport, Plan};

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent-{}", &self.0.simple().to_string()[..8])
    }
}

/// Everything one `Agent::run` produced, including intermediate artifacts.
///
/// # Invariants
/// - `success` is true iff a direct answer was given or the tool plan
///   finished cleanly.
/// - `plan_id`, `plan` and `execution` are only set on the tool path.
#[derive(Debug, Clone, Serialize)]
pub struct DoResult {
    pub request: String,

    /// Retrieval context block, when retrieval ran and found something
    pub context: Option<String>,

    pub intent: IntentResult,

    /// The request after merging retrieval context (or the original)
    pub enhanced_request: String,

    /// Whether the tool path was taken
    pub used_tools: bool,

    /// Answer given without tools
    pub direct_answer: Option<String>,

    pub plan_id: Option<String>,
    pub plan: Option<Plan>,
    pub execution: Option<ExecutionReport>,

    /// Natural-language answer synthesized from execution results
    pub final_answer: Option<String>,

    pub errors: Vec<String>,
    pub success: bool,

    #[serde(skip)]
    pub duration: Duration,
}

impl DoResult {
    pub(crate) fn new(request: &str, intent: IntentResult) -> Self {
        Self {
            request: request.to_string(),
            context: None,
            intent,
            enhanced_request: request.to_string(),
            used_tools: false,
            direct_answer: None,
            plan_id: None,
            plan: None,
            execution: None,
            final_answer: None,
            errors: Vec::new(),
            success: false,
            duration: Duration::ZERO,
        }
    }

    /// The final answer if any, else the direct answer.
    pub fn answer(&self) -> Option<&str> {
        self.final_answer.as_deref().or(self.direct_answer.as_deref())
    }

    /// Number of tool calls made by the execution.
    pub fn tool_calls(&self) -> usize {
        self.execution.as_ref().map_or(0, |e| e.steps.len())
    }

    /// Compact JSON form used as a mission task result.
    pub fn output(&self) -> Value {
        json!({
            "answer": self.answer(),
            "plan_id": self.plan_id,
            "results": self.execution.as_ref().map(|e| Value::Object(e.results.clone())),
        })
    }

    /// First recorded error, if any.
    pub fn error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}
