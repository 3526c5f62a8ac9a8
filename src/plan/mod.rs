//! Execution plans: the data model, the planner that produces them, and the
//! executor that runs them.
//!
//! # Invariants
//! - Step numbers are dense, 1-based and strictly increasing.
//! - Every entry of `depends_on` references a smaller step number.

mod executor;
mod planner;
pub mod template;

pub use executor::{ExecutionReport, ExecutionStatus, Executor, StepOutcome};
pub use planner::{Planner, PlannerConfig};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::mcp::{resolve_tool, ToolWrapper};

/// One tool invocation inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub step_number: u32,
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

/// An ordered sequence of tool invocations produced for a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub goal: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub output_format: String,
}

impl Plan {
    /// Parse a plan from already-extracted JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidPlan(format!("malformed JSON: {}", e)))
    }

    /// Check the structural invariants (numbering and dependencies).
    pub fn validate_shape(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidPlan("plan has no steps".to_string()));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.step_number != expected {
                return Err(Error::InvalidPlan(format!(
                    "step numbers must be 1..{} in order; found {} at position {}",
                    self.steps.len(),
                    step.step_number,
                    expected
                )));
            }
            if step.tool.trim().is_empty() {
                return Err(Error::InvalidPlan(format!(
                    "step {} does not name a tool",
                    step.step_number
                )));
            }
            for dep in &step.depends_on {
                if *dep < 1 || *dep >= step.step_number {
                    return Err(Error::InvalidPlan(format!(
                        "step {} depends on step {}, which does not precede it",
                        step.step_number, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check that every step names a tool present in `catalog`.
    pub fn validate_tools(&self, catalog: &[ToolWrapper]) -> Result<()> {
        for step in &self.steps {
            if resolve_tool(catalog, &step.tool).is_none() {
                return Err(Error::InvalidPlan(format!(
                    "step {} uses unknown tool '{}'",
                    step.step_number, step.tool
                )));
            }
        }
        Ok(())
    }

    /// Full validation against a tool catalog.
    pub fn validate(&self, catalog: &[ToolWrapper]) -> Result<()> {
        self.validate_shape()?;
        self.validate_tools(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::extract_json;
    use serde_json::json;

    fn tool(name: &str, server: &str) -> ToolWrapper {
        ToolWrapper {
            name: format!("{}_{}", server, name),
            original_name: name.to_string(),
            description: String::new(),
            server_name: server.to_string(),
            schema: json!({"type": "object"}),
        }
    }

    fn two_step_plan() -> Plan {
        serde_json::from_value(json!({
            "goal": "greet",
            "steps": [
                {"step_number": 1, "tool": "echo", "arguments": {"text": "hello"},
                 "description": "say hello", "expected_output": "hello", "depends_on": []},
                {"step_number": 2, "tool": "echo", "arguments": {"text": "${step_1.value}, world"},
                 "description": "extend", "expected_output": "hello, world", "depends_on": [1]}
            ],
            "output_format": "text"
        }))
        .unwrap()
    }

    #[test]
    fn valid_plan_passes() {
        let plan = two_step_plan();
        plan.validate(&[tool("echo", "demo")]).unwrap();
    }

    #[test]
    fn rejects_gaps_and_forward_dependencies() {
        let mut plan = two_step_plan();
        plan.steps[1].step_number = 3;
        assert!(matches!(plan.validate_shape(), Err(Error::InvalidPlan(_))));

        let mut plan = two_step_plan();
        plan.steps[0].depends_on = vec![2];
        assert!(matches!(plan.validate_shape(), Err(Error::InvalidPlan(_))));

        let mut plan = two_step_plan();
        plan.steps[1].depends_on = vec![0];
        assert!(matches!(plan.validate_shape(), Err(Error::InvalidPlan(_))));
    }

    #[test]
    fn rejects_unknown_tool() {
        let plan = two_step_plan();
        let err = plan.validate(&[tool("math_add", "demo")]).unwrap_err();
        assert!(err.to_string().contains("unknown tool 'echo'"));
    }

    #[test]
    fn empty_plan_is_invalid() {
        let plan = Plan::from_json(r#"{"goal":"x","steps":[]}"#).unwrap();
        assert!(plan.validate_shape().is_err());
    }

    #[test]
    fn render_extract_round_trip() {
        let plan = two_step_plan();
        let rendered = serde_json::to_string_pretty(&plan).unwrap();
        let wrapped = format!("<think>plan it</think>\n```json\n{}\n```", rendered);

        assert_eq!(Plan::from_json(&extract_json(&rendered)).unwrap(), plan);
        assert_eq!(Plan::from_json(&extract_json(&wrapped)).unwrap(), plan);
    }
}
