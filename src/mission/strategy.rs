//! Strategy generation, validation and task ordering.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::types::{MissionStrategy, StrategyType, TaskDecomposition, TaskType, DEFAULT_TIMEOUT_MINUTES};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, ChatOptions, GeneratorPool};
use crate::util::{extract_json, truncate_chars};

const STRATEGY_PROMPT: &str = r#"You are a mission commander. Split the user's goal into tasks for a team of agents and choose how they run.

Respond with strict JSON only:
{
  "type": "parallel" | "sequential" | "pipeline" | "map_reduce",
  "decomposition": [
    {"id": "t1", "description": "self-contained instruction", "type": "research" | "analysis" | "execution" | "synthesis" | "validation", "input": {}, "priority": 0}
  ],
  "dependencies": {"t2": ["t1"]},
  "max_parallel": 3,
  "timeout_minutes": 30
}

Use "pipeline" when each task transforms the previous task's output, "map_reduce" when independent tasks feed one synthesis task, "sequential" when order matters, and "parallel" otherwise."#;

/// Ask the generator for a strategy for `goal`.
pub async fn generate_strategy(
    generator: &GeneratorPool,
    goal: &str,
    tools_description: &str,
) -> Result<MissionStrategy> {
    let messages = vec![
        ChatMessage::system(format!("{}\n\n{}", STRATEGY_PROMPT, tools_description)),
        ChatMessage::user(format!("Goal: {}", goal)),
    ];
    let options = ChatOptions::with_temperature(0.2).max_tokens(3000);
    let response = generator.chat(messages, None, options, None).await?;
    let text = response.content.unwrap_or_default();
    debug!("Strategy response: {}", truncate_chars(&text, 500));
    MissionStrategy::from_response(&text)
}

impl MissionStrategy {
    /// Parse and validate a model response.
    pub fn from_response(text: &str) -> Result<Self> {
        let mut strategy: MissionStrategy = serde_json::from_str(&extract_json(text))
            .map_err(|e| Error::InvalidStrategy(format!("malformed JSON: {}", e)))?;
        strategy.validate()?;
        strategy.normalize();
        Ok(strategy)
    }

    /// Clamp knobs a model may leave at zero: `max_parallel` to one and
    /// `timeout_minutes` to the default deadline.
    pub fn normalize(&mut self) {
        self.max_parallel = self.max_parallel.max(1);
        if self.timeout_minutes == 0 {
            self.timeout_minutes = DEFAULT_TIMEOUT_MINUTES;
        }
    }

    /// Ids are unique and non-empty, dependencies name known tasks, and the
    /// dependency graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        if self.decomposition.is_empty() {
            return Err(Error::InvalidStrategy("strategy has no tasks".to_string()));
        }
        let mut seen = HashSet::new();
        for task in &self.decomposition {
            if task.id.trim().is_empty() {
                return Err(Error::InvalidStrategy("task with empty id".to_string()));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(Error::InvalidStrategy(format!("duplicate task id '{}'", task.id)));
            }
        }
        for (task, deps) in &self.dependencies {
            if !seen.contains(task.as_str()) {
                return Err(Error::InvalidStrategy(format!(
                    "dependencies mention unknown task '{}'",
                    task
                )));
            }
            if let Some(dep) = deps.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(Error::InvalidStrategy(format!(
                    "task '{}' depends on unknown task '{}'",
                    task, dep
                )));
            }
        }
        self.levels().map(|_| ())
    }

    pub fn task(&self, id: &str) -> Option<&TaskDecomposition> {
        self.decomposition.iter().find(|t| t.id == id)
    }

    /// 1-based position of a task in the decomposition.
    pub fn step_number(&self, id: &str) -> u32 {
        self.decomposition
            .iter()
            .position(|t| t.id == id)
            .map_or(0, |i| i as u32 + 1)
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Stable topological order: repeatedly take the first task, in
    /// decomposition order, whose prerequisites are all placed.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(self.decomposition.len());
        while order.len() < self.decomposition.len() {
            let next = self.decomposition.iter().find(|t| {
                !placed.contains(t.id.as_str())
                    && self
                        .dependencies_of(&t.id)
                        .iter()
                        .all(|d| placed.contains(d.as_str()))
            });
            let Some(next) = next else {
                return Err(Error::InvalidStrategy("dependency cycle between tasks".to_string()));
            };
            placed.insert(next.id.as_str());
            order.push(next.id.clone());
        }
        Ok(order)
    }

    /// Dependency levels: every task's prerequisites sit in earlier levels.
    /// Within a level, higher priority first, then decomposition order.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut depth: HashMap<String, usize> = HashMap::new();
        for id in self.execution_order()? {
            let level = self
                .dependencies_of(&id)
                .iter()
                .filter_map(|d| depth.get(d))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, level);
        }

        let count = depth.values().copied().max().map_or(0, |m| m + 1);
        let mut levels: Vec<Vec<&TaskDecomposition>> = vec![Vec::new(); count];
        for task in &self.decomposition {
            levels[depth[&task.id]].push(task);
        }
        Ok(levels
            .into_iter()
            .map(|mut level| {
                level.sort_by_key(|t| std::cmp::Reverse(t.priority));
                level.into_iter().map(|t| t.id.clone()).collect()
            })
            .collect())
    }

    /// Map tasks and the reduce task of a `map_reduce` strategy. The reduce
    /// task is the first `synthesis` task. Non-synthesis tasks are maps, and
    /// so is any later `synthesis` task: each task is scheduled exactly once,
    /// and only one task receives `map_results`.
    pub fn map_reduce_split(&self) -> (Vec<String>, Option<String>) {
        let reduce = self
            .decomposition
            .iter()
            .find(|t| t.task_type == TaskType::Synthesis)
            .map(|t| t.id.clone());
        let maps = self
            .decomposition
            .iter()
            .filter(|t| Some(&t.id) != reduce.as_ref())
            .map(|t| t.id.clone())
            .collect();
        (maps, reduce)
    }

    /// One-line summary for logs.
    pub fn describe(&self) -> String {
        format!(
            "{} strategy with {} tasks (max_parallel {})",
            self.strategy_type.as_str(),
            self.decomposition.len(),
            self.max_parallel
        )
    }

    pub fn is(&self, strategy_type: StrategyType) -> bool {
        self.strategy_type == strategy_type
    }
}
