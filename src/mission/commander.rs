//! Mission commander: turns a goal into a strategy and drives pooled agents
//! through it.
//!
//! # Invariants
//! - Every task of a running mission has a `step_progress` row from the
//!   moment the strategy is accepted.
//! - A checkpoint is written after every finished task and once at the end;
//!   resuming replays only tasks whose step row is not `completed`.
//! - Progress writes never fail a mission; they are logged and skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::strategy::generate_strategy;
use super::types::{
    AgentTask, Mission, MissionStatus, MissionStrategy, StrategyType, TaskDecomposition, TaskMetrics,
    TaskStatus,
};
use crate::agents::AgentPool;
use crate::error::{Error, Result};
use crate::llm::GeneratorPool;
use crate::mcp::ToolInvoker;
use crate::store::{MissionEntry, ProgressStore, StepStatus, StepUpdate};

#[derive(Debug, Clone)]
pub struct CommanderConfig {
    /// Extra attempts for a failed task.
    pub task_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Upper bound on a mission's deadline, whatever the strategy asks for.
    pub max_mission_duration: Option<Duration>,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self {
            task_retries: 0,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            max_mission_duration: None,
        }
    }
}

impl CommanderConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.retry_cap)
    }
}

struct MissionSlot {
    id: String,
    mission: Mutex<Mission>,
    cancel: CancellationToken,
}

/// Owns running missions and the agent team that works on them.
pub struct Commander {
    generator: Arc<GeneratorPool>,
    tools: Arc<dyn ToolInvoker>,
    agents: Arc<AgentPool>,
    progress: ProgressStore,
    config: CommanderConfig,
    missions: RwLock<HashMap<String, Arc<MissionSlot>>>,
}

impl Commander {
    pub fn new(
        generator: Arc<GeneratorPool>,
        tools: Arc<dyn ToolInvoker>,
        agents: Arc<AgentPool>,
        progress: ProgressStore,
    ) -> Self {
        Self {
            generator,
            tools,
            agents,
            progress,
            config: CommanderConfig::default(),
            missions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: CommanderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Generate a strategy for `goal` and run it to completion.
    pub async fn execute_mission(&self, goal: &str) -> Result<Mission> {
        let slot = self.register(Mission::new(Uuid::new_v4().to_string(), goal)).await;
        info!(mission_id = %slot.id, "Mission started: {}", goal);
        self.record_mission(&slot).await;

        let description = self.tools.tools_description().await;
        let strategy = match generate_strategy(&self.generator, goal, &description).await {
            Ok(strategy) => strategy,
            Err(e) => {
                self.fail_early(&slot, &e).await;
                return Err(e);
            }
        };
        self.run(slot, strategy, HashMap::new()).await
    }

    /// Run `goal` under a caller-supplied strategy.
    pub async fn execute_with_strategy(&self, goal: &str, strategy: MissionStrategy) -> Result<Mission> {
        let slot = self.register(Mission::new(Uuid::new_v4().to_string(), goal)).await;
        info!(mission_id = %slot.id, "Mission started: {}", goal);
        self.record_mission(&slot).await;
        self.run(slot, strategy, HashMap::new()).await
    }

    /// Stop a mission. No new tasks start; in-flight tool calls drain.
    ///
    /// Cancelling a cancelled mission is a no-op. Finished missions refuse.
    pub async fn cancel_mission(&self, mission_id: &str) -> Result<()> {
        let slot = self.missions.read().await.get(mission_id).cloned();
        let Some(slot) = slot else {
            let progress = self.progress.get_mission_progress(mission_id).await?;
            return match progress.mission.status {
                MissionStatus::Cancelled => Ok(()),
                status if status.is_terminal() => Err(refuse(mission_id, status, "cancel")),
                _ => {
                    self.progress
                        .set_mission_status(mission_id, MissionStatus::Cancelled, None)
                        .await
                }
            };
        };

        {
            let mut mission = slot.mission.lock().await;
            match mission.status {
                MissionStatus::Cancelled => return Ok(()),
                status if status.is_terminal() => return Err(refuse(mission_id, status, "cancel")),
                _ => {}
            }
            slot.cancel.cancel();
            mission.status = MissionStatus::Cancelled;
            mission.ended_at = Some(Utc::now());
        }
        soft(
            self.progress
                .set_mission_status(mission_id, MissionStatus::Cancelled, None)
                .await,
            "cancel mission",
        );
        info!(mission_id = %mission_id, "Mission cancelled");
        Ok(())
    }

    /// Continue an interrupted mission from its last checkpoint. Tasks whose
    /// step row is `completed` keep their result and are not re-run.
    pub async fn resume_mission(&self, mission_id: &str) -> Result<Mission> {
        if let Some(slot) = self.missions.read().await.get(mission_id).cloned() {
            let status = slot.mission.lock().await.status;
            if !status.is_terminal() {
                return Err(Error::InvalidState(format!("mission {} is still running", mission_id)));
            }
        }

        let progress = self.progress.get_mission_progress(mission_id).await?;
        let status = progress.mission.status;
        if matches!(status, MissionStatus::Completed | MissionStatus::Failed) {
            return Err(refuse(mission_id, status, "resume"));
        }

        let checkpoint = self.progress.get_latest_checkpoint(mission_id).await?;
        let strategy = checkpoint
            .as_ref()
            .and_then(|c| c.data.get("strategy"))
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| progress.mission.strategy.clone())
            .ok_or_else(|| Error::InvalidStrategy(format!("no strategy recorded for mission {}", mission_id)))?;
        let strategy: MissionStrategy =
            serde_json::from_value(strategy).map_err(|e| Error::InvalidStrategy(e.to_string()))?;

        let saved = checkpoint
            .as_ref()
            .and_then(|c| c.data.get("results"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let completed: HashMap<String, Value> = progress
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| {
                let result = saved
                    .get(&s.task_id)
                    .cloned()
                    .or_else(|| s.output_data.clone())
                    .unwrap_or(Value::Null);
                (s.task_id.clone(), result)
            })
            .collect();

        info!(
            mission_id = %mission_id,
            completed = completed.len(),
            total = strategy.decomposition.len(),
            "Resuming mission"
        );
        let slot = self
            .register(Mission::new(mission_id, progress.mission.goal.clone()))
            .await;
        self.run(slot, strategy, completed).await
    }

    /// Write a checkpoint of the mission's current state.
    pub async fn save_checkpoint(&self, mission_id: &str) -> Result<i64> {
        let slot = self
            .missions
            .read()
            .await
            .get(mission_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("mission {}", mission_id)))?;
        let data = snapshot(&*slot.mission.lock().await);
        let name = format!("manual_{}", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        self.progress.save_checkpoint(mission_id, &name, &data).await
    }

    pub async fn get_mission(&self, mission_id: &str) -> Option<Mission> {
        let slot = self.missions.read().await.get(mission_id).cloned()?;
        let mission = slot.mission.lock().await.clone();
        Some(mission)
    }

    /// Missions known to this commander, newest first.
    pub async fn list_missions(&self) -> Vec<Mission> {
        let slots: Vec<_> = self.missions.read().await.values().cloned().collect();
        let mut missions = Vec::with_capacity(slots.len());
        for slot in slots {
            missions.push(slot.mission.lock().await.clone());
        }
        missions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        missions
    }

    /// Forget finished missions that ended at least `older_than` ago.
    /// Their progress rows stay in the store.
    pub async fn cleanup_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut missions = self.missions.write().await;
        let mut stale = Vec::new();
        for (id, slot) in missions.iter() {
            let mission = slot.mission.lock().await;
            if mission.status.is_terminal() && mission.ended_at.is_some_and(|t| t <= cutoff) {
                stale.push(id.clone());
            }
        }
        for id in &stale {
            missions.remove(id);
        }
        if !stale.is_empty() {
            debug!("Cleaned up {} finished missions", stale.len());
        }
        stale.len()
    }

    async fn register(&self, mission: Mission) -> Arc<MissionSlot> {
        let slot = Arc::new(MissionSlot {
            id: mission.id.clone(),
            mission: Mutex::new(mission),
            cancel: CancellationToken::new(),
        });
        self.missions.write().await.insert(slot.id.clone(), slot.clone());
        slot
    }

    async fn run(
        &self,
        slot: Arc<MissionSlot>,
        mut strategy: MissionStrategy,
        completed: HashMap<String, Value>,
    ) -> Result<Mission> {
        if let Err(e) = strategy.validate() {
            self.fail_early(&slot, &e).await;
            return Err(e);
        }
        strategy.normalize();
        if slot.cancel.is_cancelled() {
            return Ok(self.finish(&slot, None).await);
        }

        {
            let mut mission = slot.mission.lock().await;
            mission.strategy = Some(strategy.clone());
            mission.status = MissionStatus::Executing;
            for task in &strategy.decomposition {
                let mut state = AgentTask::new(task);
                if let Some(result) = completed.get(&task.id) {
                    state.status = TaskStatus::Completed;
                    state.result = Some(result.clone());
                    mission.results.insert(task.id.clone(), result.clone());
                }
                mission.tasks.insert(task.id.clone(), state);
            }
        }
        self.record_mission(&slot).await;

        for task in strategy.decomposition.iter().filter(|t| !completed.contains_key(&t.id)) {
            let update = StepUpdate::new(
                &slot.id,
                &task.id,
                strategy.step_number(&task.id),
                StepStatus::Pending,
                0.0,
            )
            .description(&task.description)
            .input(Value::Object(task.input.clone()));
            soft(self.progress.update_step_progress(update).await, "register task");
        }

        info!(mission_id = %slot.id, "Executing {}", strategy.describe());
        let mut deadline = Duration::from_secs(strategy.timeout_minutes.saturating_mul(60));
        if let Some(cap) = self.config.max_mission_duration {
            deadline = deadline.min(cap);
        }

        let forced = match tokio::time::timeout(deadline, self.dispatch(&slot, &strategy)).await {
            Ok(forced) => forced,
            Err(_) => Some(format!("mission timed out after {:?}", deadline)),
        };
        Ok(self.finish(&slot, forced).await)
    }

    /// Run the tasks under the strategy's topology. Returns a reason when
    /// the mission must fail regardless of individual task outcomes.
    async fn dispatch(&self, slot: &MissionSlot, strategy: &MissionStrategy) -> Option<String> {
        match strategy.strategy_type {
            StrategyType::Parallel => self.run_parallel(slot, strategy).await,
            StrategyType::Sequential => self.run_sequential(slot, strategy).await,
            StrategyType::Pipeline => self.run_pipeline(slot, strategy).await,
            StrategyType::MapReduce => self.run_map_reduce(slot, strategy).await,
        }
    }

    /// Dependency levels in order; each level runs up to `max_parallel`
    /// tasks at once. Tasks see their prerequisites' results under
    /// `dependency_results`.
    async fn run_parallel(&self, slot: &MissionSlot, strategy: &MissionStrategy) -> Option<String> {
        let levels = match strategy.levels() {
            Ok(levels) => levels,
            Err(e) => return Some(e.to_string()),
        };

        for level in levels {
            if slot.cancel.is_cancelled() {
                break;
            }
            let mut jobs = Vec::new();
            for id in &level {
                let Some(task) = strategy.task(id) else { continue };
                if completed_result(slot, id).await.is_some() {
                    continue;
                }
                let mut input = task.input.clone();
                let deps = strategy.dependencies_of(id);
                if !deps.is_empty() {
                    let mut upstream = Map::new();
                    let mut failed = None;
                    for dep in deps {
                        match completed_result(slot, dep).await {
                            Some(result) => {
                                upstream.insert(dep.clone(), result);
                            }
                            None => {
                                failed = Some(dep.clone());
                                break;
                            }
                        }
                    }
                    if let Some(dep) = failed {
                        self.skip_task(slot, strategy, task, &format!("upstream task {} failed", dep))
                            .await;
                        continue;
                    }
                    input.insert("dependency_results".to_string(), Value::Object(upstream));
                }
                jobs.push(self.run_task(slot, strategy, task, input));
            }

            stream::iter(jobs)
                .buffer_unordered(strategy.max_parallel)
                .collect::<Vec<_>>()
                .await;
        }
        None
    }

    /// One task at a time in dependency order. Each task sees every earlier
    /// success under `previous_results`; failures do not stop the run.
    async fn run_sequential(&self, slot: &MissionSlot, strategy: &MissionStrategy) -> Option<String> {
        let order = match strategy.execution_order() {
            Ok(order) => order,
            Err(e) => return Some(e.to_string()),
        };

        let mut previous = Map::new();
        for id in order {
            if slot.cancel.is_cancelled() {
                break;
            }
            let Some(task) = strategy.task(&id) else { continue };
            if let Some(result) = completed_result(slot, &id).await {
                previous.insert(id, result);
                continue;
            }
            let mut input = task.input.clone();
            if !previous.is_empty() {
                input.insert("previous_results".to_string(), Value::Object(previous.clone()));
            }
            if let Some(result) = self.run_task(slot, strategy, task, input).await {
                previous.insert(id, result);
            }
        }
        None
    }

    /// Each task receives the previous task's output as `pipeline_input`.
    /// A failure fails every later stage.
    async fn run_pipeline(&self, slot: &MissionSlot, strategy: &MissionStrategy) -> Option<String> {
        let order = match strategy.execution_order() {
            Ok(order) => order,
            Err(e) => return Some(e.to_string()),
        };

        let mut carried: Option<Value> = None;
        let mut broken: Option<String> = None;
        for id in order {
            if slot.cancel.is_cancelled() {
                return None;
            }
            let Some(task) = strategy.task(&id) else { continue };
            if let Some(upstream) = &broken {
                self.skip_task(slot, strategy, task, &format!("upstream task {} failed", upstream))
                    .await;
                continue;
            }
            if let Some(result) = completed_result(slot, &id).await {
                carried = Some(result);
                continue;
            }
            let mut input = task.input.clone();
            if let Some(previous) = &carried {
                input.insert("pipeline_input".to_string(), previous.clone());
            }
            match self.run_task(slot, strategy, task, input).await {
                Some(result) => carried = Some(result),
                None => broken = Some(id),
            }
        }

        if broken.is_none() {
            if let Some(output) = carried {
                slot.mission
                    .lock()
                    .await
                    .results
                    .insert("final_output".to_string(), output);
            }
        }
        None
    }

    /// Map tasks run in parallel; the reduce task gets their results under
    /// `map_results`. Any map failure fails the mission.
    async fn run_map_reduce(&self, slot: &MissionSlot, strategy: &MissionStrategy) -> Option<String> {
        let (maps, reduce) = strategy.map_reduce_split();

        let mut jobs = Vec::new();
        for id in &maps {
            let Some(task) = strategy.task(id) else { continue };
            if completed_result(slot, id).await.is_none() {
                jobs.push(self.run_task(slot, strategy, task, task.input.clone()));
            }
        }
        stream::iter(jobs)
            .buffer_unordered(strategy.max_parallel)
            .collect::<Vec<_>>()
            .await;
        if slot.cancel.is_cancelled() {
            return None;
        }

        let mut map_results = Map::new();
        let mut failed = Vec::new();
        for id in &maps {
            match completed_result(slot, id).await {
                Some(result) => {
                    map_results.insert(id.clone(), result);
                }
                None => failed.push(id.clone()),
            }
        }
        let reduce = reduce.as_deref().and_then(|id| strategy.task(id));

        if !failed.is_empty() {
            let reason = format!("map task {} failed", failed.join(", "));
            if let Some(task) = reduce {
                self.skip_task(slot, strategy, task, &reason).await;
            }
            return Some(reason);
        }

        let output = match reduce {
            Some(task) => match completed_result(slot, &task.id).await {
                Some(result) => Some(result),
                None => {
                    let mut input = task.input.clone();
                    input.insert("map_results".to_string(), Value::Object(map_results));
                    self.run_task(slot, strategy, task, input).await
                }
            },
            None => Some(Value::Object(map_results)),
        };
        if let Some(output) = output {
            slot.mission.lock().await.results.insert("final".to_string(), output);
        }
        None
    }

    /// Check out an agent and run one task with retries. Returns the
    /// task's output on success.
    async fn run_task(
        &self,
        slot: &MissionSlot,
        strategy: &MissionStrategy,
        task: &TaskDecomposition,
        input: Map<String, Value>,
    ) -> Option<Value> {
        let mission_id = slot.id.as_str();
        let step = strategy.step_number(&task.id);

        // Cancelled while waiting: `finish` records the task as cancelled.
        let agent = self.agents.get_cancellable(&slot.cancel).await.ok()?;
        let agent_id = agent.id().to_string();

        update_task(slot, &task.id, |t| {
            t.status = TaskStatus::Assigned;
            t.agent_id = Some(agent_id.clone());
            t.started_at = Some(Utc::now());
        })
        .await;
        soft(
            self.progress
                .log_agent_activity(
                    mission_id,
                    &agent_id,
                    "task_assigned",
                    &json!({ "task_id": task.id, "description": task.description }),
                )
                .await,
            "log assignment",
        );
        let working = StepUpdate::new(mission_id, &task.id, step, StepStatus::Working, 0.0)
            .agent(&agent_id)
            .description(&task.description)
            .input(Value::Object(input.clone()));
        soft(self.progress.update_step_progress(working).await, "step working");

        let request = task_request(task, &input);
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut tool_calls = 0u32;

        let outcome = loop {
            update_task(slot, &task.id, |t| t.status = TaskStatus::Working).await;
            let executing = StepUpdate::new(mission_id, &task.id, step, StepStatus::Executing, 25.0)
                .agent(&agent_id)
                .retry_count(attempt);
            soft(self.progress.update_step_progress(executing).await, "step executing");

            let result = agent.run_with_cancel(&request, &slot.cancel).await;
            tool_calls += result.tool_calls() as u32;
            if result.success {
                break Ok(result.output());
            }

            let error = result.error().unwrap_or("task failed").to_string();
            if attempt >= self.config.task_retries || slot.cancel.is_cancelled() {
                break Err(error);
            }
            let delay = self.config.backoff(attempt);
            attempt += 1;
            warn!(
                mission_id = %mission_id,
                task_id = %task.id,
                attempt,
                "Task failed, retrying in {:?}: {}",
                delay,
                error
            );
            update_task(slot, &task.id, |t| {
                t.status = TaskStatus::Retrying;
                t.metrics.retry_count = attempt;
            })
            .await;
            let retrying = StepUpdate::new(mission_id, &task.id, step, StepStatus::Retrying, 25.0)
                .agent(&agent_id)
                .retry_count(attempt);
            soft(self.progress.update_step_progress(retrying).await, "step retrying");

            tokio::select! {
                _ = slot.cancel.cancelled() => break Err(format!("cancelled after: {}", error)),
                _ = tokio::time::sleep(delay) => {}
            }
        };
        drop(agent);

        let metrics = TaskMetrics {
            tokens_used: 0,
            tool_calls,
            execution_time_ms: started.elapsed().as_millis() as u64,
            retry_count: attempt,
        };
        let metrics_json = json!({
            "tool_calls": metrics.tool_calls,
            "execution_time_ms": metrics.execution_time_ms,
            "retry_count": metrics.retry_count,
        });
        let (result, error) = match &outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e.as_str())),
        };
        soft(
            self.progress
                .save_step_result(mission_id, &task.id, step, result, &metrics_json, error)
                .await,
            "step result",
        );
        soft(
            self.progress
                .save_metric(
                    mission_id,
                    "task_duration_ms",
                    metrics.execution_time_ms as f64,
                    Some(&json!({ "task_id": task.id })),
                )
                .await,
            "task metric",
        );
        let activity = if outcome.is_ok() { "task_completed" } else { "task_failed" };
        soft(
            self.progress
                .log_agent_activity(
                    mission_id,
                    &agent_id,
                    activity,
                    &json!({ "task_id": task.id, "error": error }),
                )
                .await,
            "log completion",
        );

        {
            let mut mission = slot.mission.lock().await;
            if let Some(state) = mission.tasks.get_mut(&task.id) {
                state.ended_at = Some(Utc::now());
                state.metrics = metrics;
                match &outcome {
                    Ok(value) => {
                        state.status = TaskStatus::Completed;
                        state.result = Some(value.clone());
                    }
                    Err(e) => {
                        state.status = TaskStatus::Failed;
                        state.error = Some(e.clone());
                    }
                }
            }
            match &outcome {
                Ok(value) => {
                    mission.results.insert(task.id.clone(), value.clone());
                }
                Err(e) => mission.errors.push(format!("task {}: {}", task.id, e)),
            }
        }
        match &outcome {
            Ok(_) => info!(mission_id = %mission_id, task_id = %task.id, "Task completed"),
            Err(e) => warn!(mission_id = %mission_id, task_id = %task.id, "Task failed: {}", e),
        }

        self.checkpoint(slot, &format!("after_{}", task.id)).await;
        outcome.ok()
    }

    /// Fail a task without running it.
    async fn skip_task(&self, slot: &MissionSlot, strategy: &MissionStrategy, task: &TaskDecomposition, reason: &str) {
        {
            let mut mission = slot.mission.lock().await;
            if let Some(state) = mission.tasks.get_mut(&task.id) {
                state.status = TaskStatus::Failed;
                state.error = Some(reason.to_string());
                state.ended_at = Some(Utc::now());
            }
            mission.errors.push(format!("task {}: {}", task.id, reason));
        }
        soft(
            self.progress
                .save_step_result(
                    &slot.id,
                    &task.id,
                    strategy.step_number(&task.id),
                    None,
                    &json!({}),
                    Some(reason),
                )
                .await,
            "skipped step",
        );
    }

    /// Settle unfinished tasks, set the final status and write the final
    /// checkpoint.
    async fn finish(&self, slot: &MissionSlot, forced: Option<String>) -> Mission {
        let strategy = slot.mission.lock().await.strategy.clone();
        let unfinished: Vec<String> = {
            let mission = slot.mission.lock().await;
            let mut ids: Vec<String> = mission
                .tasks
                .values()
                .filter(|t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
                .map(|t| t.task_id.clone())
                .collect();
            ids.sort();
            ids
        };

        let cancelled = slot.cancel.is_cancelled();
        let reason = match (&forced, cancelled) {
            (_, true) => "mission cancelled".to_string(),
            (Some(reason), false) => reason.clone(),
            (None, false) => "task did not run".to_string(),
        };
        for id in &unfinished {
            let step = strategy.as_ref().map_or(0, |s| s.step_number(id));
            update_task(slot, id, |t| {
                t.status = TaskStatus::Failed;
                t.error = Some(reason.clone());
                t.ended_at = Some(Utc::now());
            })
            .await;
            if cancelled {
                let update = StepUpdate::new(&slot.id, id, step, StepStatus::Cancelled, 0.0);
                soft(self.progress.update_step_progress(update).await, "cancel step");
            } else {
                soft(
                    self.progress
                        .save_step_result(&slot.id, id, step, None, &json!({}), Some(&reason))
                        .await,
                    "unfinished step",
                );
            }
        }

        let snapshot = {
            let mut mission = slot.mission.lock().await;
            // `cancel_mission` sets the status under this lock.
            let cancelled = cancelled || mission.status == MissionStatus::Cancelled;
            let status = if cancelled {
                MissionStatus::Cancelled
            } else if forced.is_some() {
                MissionStatus::Failed
            } else {
                mission.outcome_status()
            };
            if let Some(reason) = forced {
                mission.errors.push(reason);
            }
            mission.status = status;
            if mission.ended_at.is_none() || status != MissionStatus::Cancelled {
                mission.ended_at = Some(Utc::now());
            }
            mission.clone()
        };

        if snapshot.status != MissionStatus::Cancelled {
            let error = snapshot.errors.first().map(String::as_str);
            soft(
                self.progress
                    .set_mission_status(&slot.id, snapshot.status, error)
                    .await,
                "final status",
            );
        }
        self.checkpoint(slot, "final").await;

        info!(
            mission_id = %slot.id,
            status = %snapshot.status,
            completed = snapshot.count(TaskStatus::Completed),
            failed = snapshot.count(TaskStatus::Failed),
            "Mission finished"
        );
        snapshot
    }

    async fn fail_early(&self, slot: &MissionSlot, error: &Error) {
        {
            let mut mission = slot.mission.lock().await;
            mission.status = MissionStatus::Failed;
            mission.errors.push(error.to_string());
            mission.ended_at = Some(Utc::now());
        }
        warn!(mission_id = %slot.id, "Mission failed before dispatch: {}", error);
        soft(
            self.progress
                .set_mission_status(&slot.id, MissionStatus::Failed, Some(&error.to_string()))
                .await,
            "fail mission",
        );
    }

    async fn record_mission(&self, slot: &MissionSlot) {
        let entry = {
            let mission = slot.mission.lock().await;
            let strategy = mission.strategy.as_ref();
            MissionEntry {
                mission_id: mission.id.clone(),
                goal: mission.goal.clone(),
                strategy_type: strategy.map(|s| s.strategy_type.as_str().to_string()),
                strategy: strategy.and_then(|s| serde_json::to_value(s).ok()),
                status: mission.status,
                total_tasks: strategy.map_or(0, |s| s.decomposition.len()),
                metadata: json!({
                    "max_parallel": strategy.map(|s| s.max_parallel),
                    "timeout_minutes": strategy.map(|s| s.timeout_minutes),
                }),
            }
        };
        soft(self.progress.save_mission_progress(&entry).await, "save mission");
    }

    async fn checkpoint(&self, slot: &MissionSlot, name: &str) {
        let data = snapshot(&*slot.mission.lock().await);
        soft(self.progress.save_checkpoint(&slot.id, name, &data).await, "checkpoint");
    }
}

fn refuse(mission_id: &str, status: MissionStatus, action: &str) -> Error {
    Error::InvalidState(format!("cannot {} mission {}: it is {}", action, mission_id, status))
}

fn soft<T>(result: Result<T>, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Progress write failed ({}): {}", what, e);
            None
        }
    }
}

async fn update_task(slot: &MissionSlot, task_id: &str, f: impl FnOnce(&mut AgentTask)) {
    if let Some(task) = slot.mission.lock().await.tasks.get_mut(task_id) {
        f(task);
    }
}

async fn completed_result(slot: &MissionSlot, task_id: &str) -> Option<Value> {
    let mission = slot.mission.lock().await;
    let task = mission.tasks.get(task_id)?;
    if task.status == TaskStatus::Completed {
        Some(task.result.clone().unwrap_or(Value::Null))
    } else {
        None
    }
}

/// Request text handed to the agent for one task.
fn task_request(task: &TaskDecomposition, input: &Map<String, Value>) -> String {
    if input.is_empty() {
        return task.description.clone();
    }
    let input = serde_json::to_string_pretty(input).unwrap_or_default();
    format!("{}\n\nInput:\n{}", task.description, input)
}

fn snapshot(mission: &Mission) -> Value {
    let tasks: Map<String, Value> = mission
        .tasks
        .iter()
        .map(|(id, t)| {
            (
                id.clone(),
                json!({
                    "status": t.status,
                    "agent_id": t.agent_id,
                    "error": t.error,
                    "retry_count": t.metrics.retry_count,
                }),
            )
        })
        .collect();
    json!({
        "status": mission.status,
        "strategy": mission.strategy,
        "results": mission.results,
        "tasks": tasks,
        "errors": mission.errors,
    })
}
