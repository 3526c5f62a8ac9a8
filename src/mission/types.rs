//! Mission data model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
    PartialFailure,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Planning => "planning",
            MissionStatus::Executing => "executing",
            MissionStatus::Completed => "completed",
            MissionStatus::Failed => "failed",
            MissionStatus::Cancelled => "cancelled",
            MissionStatus::PartialFailure => "partial_failure",
        }
    }

    /// Unknown text reads as `planning`.
    pub fn parse(s: &str) -> Self {
        match s {
            "executing" => MissionStatus::Executing,
            "completed" => MissionStatus::Completed,
            "failed" => MissionStatus::Failed,
            "cancelled" => MissionStatus::Cancelled,
            "partial_failure" => MissionStatus::PartialFailure,
            _ => MissionStatus::Planning,
        }
    }

    /// No further work will happen without a resume.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MissionStatus::Planning | MissionStatus::Executing)
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topology a mission's tasks run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Parallel,
    Sequential,
    Pipeline,
    MapReduce,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Parallel => "parallel",
            StrategyType::Sequential => "sequential",
            StrategyType::Pipeline => "pipeline",
            StrategyType::MapReduce => "map_reduce",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Research,
    Analysis,
    #[default]
    Execution,
    Synthesis,
    Validation,
}

/// One task of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecomposition {
    pub id: String,
    pub description: String,
    #[serde(rename = "type", alias = "task_type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Higher runs first among tasks that are ready together.
    #[serde(default)]
    pub priority: i32,
}

fn default_max_parallel() -> usize {
    3
}

/// Mission deadline when a strategy gives none (or zero).
pub(super) const DEFAULT_TIMEOUT_MINUTES: u64 = 30;

fn default_timeout_minutes() -> u64 {
    DEFAULT_TIMEOUT_MINUTES
}

/// How a mission's goal is split up and run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStrategy {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    pub decomposition: Vec<TaskDecomposition>,
    /// Task id to prerequisite task ids.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Assigned,
    Working,
    Completed,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub tokens_used: u64,
    pub tool_calls: u32,
    pub execution_time_ms: u64,
    pub retry_count: u32,
}

/// Runtime state of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: String,
    pub agent_id: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metrics: TaskMetrics,
}

impl AgentTask {
    pub fn new(task: &TaskDecomposition) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: None,
            description: task.description.clone(),
            status: TaskStatus::Idle,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
            metrics: TaskMetrics::default(),
        }
    }
}

/// A goal decomposed into tasks and run under one topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub goal: String,
    pub strategy: Option<MissionStrategy>,
    pub tasks: HashMap<String, AgentTask>,
    pub status: MissionStatus,
    pub results: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl Mission {
    pub fn new(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            strategy: None,
            tasks: HashMap::new(),
            status: MissionStatus::Planning,
            results: Map::new(),
            started_at: Utc::now(),
            ended_at: None,
            errors: Vec::new(),
        }
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Status implied by task outcomes alone.
    pub fn outcome_status(&self) -> MissionStatus {
        let completed = self.count(TaskStatus::Completed);
        if completed == self.tasks.len() {
            MissionStatus::Completed
        } else if completed > 0 {
            MissionStatus::PartialFailure
        } else {
            MissionStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strategy_defaults() {
        let strategy: MissionStrategy = serde_json::from_value(json!({
            "type": "map_reduce",
            "decomposition": [{"id": "t1", "description": "look"}]
        }))
        .unwrap();
        assert_eq!(strategy.strategy_type, StrategyType::MapReduce);
        assert_eq!(strategy.max_parallel, 3);
        assert_eq!(strategy.timeout_minutes, 30);
        assert_eq!(strategy.decomposition[0].task_type, TaskType::Execution);
        assert!(strategy.dependencies.is_empty());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            MissionStatus::Planning,
            MissionStatus::Executing,
            MissionStatus::Completed,
            MissionStatus::Failed,
            MissionStatus::Cancelled,
            MissionStatus::PartialFailure,
        ] {
            assert_eq!(MissionStatus::parse(status.as_str()), status);
        }
        assert!(MissionStatus::PartialFailure.is_terminal());
        assert!(!MissionStatus::Executing.is_terminal());
    }

    #[test]
    fn outcome_status_rule() {
        let mut mission = Mission::new("m", "g");
        let decomposition: Vec<TaskDecomposition> = serde_json::from_value(json!([
            {"id": "a", "description": ""}, {"id": "b", "description": ""}
        ]))
        .unwrap();
        for task in &decomposition {
            mission.tasks.insert(task.id.clone(), AgentTask::new(task));
        }
        mission.tasks.get_mut("a").unwrap().status = TaskStatus::Completed;
        mission.tasks.get_mut("b").unwrap().status = TaskStatus::Failed;
        assert_eq!(mission.outcome_status(), MissionStatus::PartialFailure);
        mission.tasks.get_mut("b").unwrap().status = TaskStatus::Completed;
        assert_eq!(mission.outcome_status(), MissionStatus::Completed);
    }
}
