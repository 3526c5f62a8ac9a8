//! Mission progress, step progress, checkpoints, events and metrics
//! (`progress.db`).
//!
//! # Invariants
//! - `mission_progress.progress_percentage` is the mean of the mission's
//!   `step_progress.progress_percentage` rows, recomputed after every step
//!   write.
//! - A `cancelled` mission keeps that status regardless of later step writes.
//! - Every child row references an existing mission and is removed with it.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{from_json_text, open_database, open_memory, to_json_text, with_conn, SharedConnection};
use crate::error::{Error, Result};
use crate::mission::MissionStatus;
use crate::util::now_string;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS mission_progress (
    mission_id TEXT PRIMARY KEY NOT NULL,
    goal TEXT NOT NULL,
    strategy_type TEXT,
    strategy_json TEXT,
    status TEXT NOT NULL,
    total_tasks INTEGER NOT NULL DEFAULT 0,
    completed_tasks INTEGER NOT NULL DEFAULT 0,
    failed_tasks INTEGER NOT NULL DEFAULT 0,
    progress_percentage REAL NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_mission_progress_status ON mission_progress(status);

CREATE TABLE IF NOT EXISTS step_progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mission_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    agent_id TEXT,
    step_number INTEGER NOT NULL,
    description TEXT,
    status TEXT NOT NULL,
    progress_percentage REAL NOT NULL DEFAULT 0,
    started_at TEXT,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    duration_ms INTEGER,
    input_data TEXT,
    output_data TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    metrics TEXT,
    UNIQUE (mission_id, task_id, step_number),
    FOREIGN KEY (mission_id) REFERENCES mission_progress(mission_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_step_progress_mission ON step_progress(mission_id);
CREATE INDEX IF NOT EXISTS idx_step_progress_status ON step_progress(status);

CREATE TABLE IF NOT EXISTS agent_activity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mission_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    details TEXT,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (mission_id) REFERENCES mission_progress(mission_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_agent_activity_mission ON agent_activity(mission_id);

CREATE TABLE IF NOT EXISTS progress_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mission_id TEXT NOT NULL,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (mission_id) REFERENCES mission_progress(mission_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_mission ON progress_checkpoints(mission_id);

CREATE TABLE IF NOT EXISTS progress_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mission_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (mission_id) REFERENCES mission_progress(mission_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_progress_events_mission ON progress_events(mission_id);

CREATE TABLE IF NOT EXISTS performance_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mission_id TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    value REAL NOT NULL,
    metadata TEXT,
    recorded_at TEXT NOT NULL,
    FOREIGN KEY (mission_id) REFERENCES mission_progress(mission_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_metrics_mission ON performance_metrics(mission_id);
"#;

const STEP_COLUMNS: &str = "id, mission_id, task_id, agent_id, step_number, description, status, \
     progress_percentage, started_at, updated_at, completed_at, duration_ms, input_data, \
     output_data, error_message, retry_count, metrics";

const MISSION_COLUMNS: &str = "mission_id, goal, strategy_type, strategy_json, status, total_tasks, \
     completed_tasks, failed_tasks, progress_percentage, started_at, updated_at, completed_at, metadata";

/// Lifecycle of one task step as recorded in `step_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Working,
    Executing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Working => "working",
            StepStatus::Executing => "executing",
            StepStatus::Retrying => "retrying",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "working" => StepStatus::Working,
            "executing" => StepStatus::Executing,
            "retrying" => StepStatus::Retrying,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            "cancelled" => StepStatus::Cancelled,
            _ => StepStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

/// Values written by [`ProgressStore::save_mission_progress`].
#[derive(Debug, Clone)]
pub struct MissionEntry {
    pub mission_id: String,
    pub goal: String,
    pub strategy_type: Option<String>,
    pub strategy: Option<Value>,
    pub status: MissionStatus,
    pub total_tasks: usize,
    pub metadata: Value,
}

/// One step write. Optional fields left `None` keep their stored value.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub mission_id: String,
    pub task_id: String,
    pub agent_id: Option<String>,
    pub step_number: u32,
    pub status: StepStatus,
    pub percentage: f64,
    pub description: Option<String>,
    pub input: Option<Value>,
    pub retry_count: Option<u32>,
}

impl StepUpdate {
    pub fn new(
        mission_id: impl Into<String>,
        task_id: impl Into<String>,
        step_number: u32,
        status: StepStatus,
        percentage: f64,
    ) -> Self {
        Self {
            mission_id: mission_id.into(),
            task_id: task_id.into(),
            agent_id: None,
            step_number,
            status,
            percentage,
            description: None,
            input: None,
            retry_count: None,
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissionProgressRecord {
    pub mission_id: String,
    pub goal: String,
    pub strategy_type: Option<String>,
    pub strategy: Option<Value>,
    pub status: MissionStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub progress_percentage: f64,
    pub started_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepProgressRecord {
    pub id: i64,
    pub mission_id: String,
    pub task_id: String,
    pub agent_id: Option<String>,
    pub step_number: u32,
    pub description: Option<String>,
    pub status: StepStatus,
    pub progress_percentage: f64,
    pub started_at: Option<String>,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub metrics: Option<Value>,
}

/// A mission row together with its step rows, ordered by step number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionProgress {
    pub mission: MissionProgressRecord,
    pub steps: Vec<StepProgressRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: i64,
    pub mission_id: String,
    pub name: String,
    pub data: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub id: i64,
    pub event_type: String,
    pub data: Option<Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentActivity {
    pub agent_id: String,
    pub activity_type: String,
    pub details: Option<Value>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    pub value: f64,
    pub metadata: Option<Value>,
    pub recorded_at: String,
}

/// SQLite store for mission progress.
///
/// All reads and writes share one connection behind the store mutex, so
/// events are totally ordered per mission.
#[derive(Clone)]
pub struct ProgressStore {
    conn: SharedConnection,
}

impl ProgressStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(path.as_ref(), SCHEMA).await?;
        tracing::info!("Progress store opened at {}", path.as_ref().display());
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: open_memory(SCHEMA)?,
        })
    }

    /// Upsert the mission row. Writes `mission_started` on first insert and
    /// `mission_updated` afterwards.
    pub async fn save_mission_progress(&self, entry: &MissionEntry) -> Result<()> {
        let entry = entry.clone();
        let strategy_json = entry.strategy.as_ref().map(to_json_text).transpose()?;
        let metadata = to_json_text(&entry.metadata)?;

        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let now = now_string();
            let existed: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM mission_progress WHERE mission_id = ?1)",
                params![entry.mission_id],
                |row| row.get(0),
            )?;
            let completed_at = entry.status.is_terminal().then(|| now.clone());

            tx.execute(
                "INSERT INTO mission_progress
                    (mission_id, goal, strategy_type, strategy_json, status, total_tasks,
                     started_at, updated_at, completed_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9)
                 ON CONFLICT(mission_id) DO UPDATE SET
                    goal = excluded.goal,
                    strategy_type = COALESCE(excluded.strategy_type, mission_progress.strategy_type),
                    strategy_json = COALESCE(excluded.strategy_json, mission_progress.strategy_json),
                    status = excluded.status,
                    total_tasks = excluded.total_tasks,
                    updated_at = excluded.updated_at,
                    completed_at = COALESCE(excluded.completed_at, mission_progress.completed_at),
                    metadata = excluded.metadata",
                params![
                    entry.mission_id,
                    entry.goal,
                    entry.strategy_type,
                    strategy_json,
                    entry.status.as_str(),
                    entry.total_tasks as i64,
                    now,
                    completed_at,
                    metadata
                ],
            )?;

            let event = if existed { "mission_updated" } else { "mission_started" };
            insert_event(
                &tx,
                &entry.mission_id,
                event,
                &json!({ "status": entry.status.as_str(), "total_tasks": entry.total_tasks }),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Upsert one step row keyed by (mission, task, step number) and
    /// recompute the mission aggregate.
    pub async fn update_step_progress(&self, update: StepUpdate) -> Result<()> {
        let input = update.input.as_ref().map(to_json_text).transpose()?;

        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let now = now_string();
            let started_at = (update.status != StepStatus::Pending).then(|| now.clone());

            tx.execute(
                "INSERT INTO step_progress
                    (mission_id, task_id, agent_id, step_number, description, status,
                     progress_percentage, started_at, updated_at, input_data, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, COALESCE(?11, 0))
                 ON CONFLICT(mission_id, task_id, step_number) DO UPDATE SET
                    agent_id = COALESCE(excluded.agent_id, step_progress.agent_id),
                    description = COALESCE(excluded.description, step_progress.description),
                    status = excluded.status,
                    progress_percentage = excluded.progress_percentage,
                    started_at = COALESCE(step_progress.started_at, excluded.started_at),
                    updated_at = excluded.updated_at,
                    input_data = COALESCE(excluded.input_data, step_progress.input_data),
                    retry_count = COALESCE(?11, step_progress.retry_count)",
                params![
                    update.mission_id,
                    update.task_id,
                    update.agent_id,
                    update.step_number,
                    update.description,
                    update.status.as_str(),
                    update.percentage,
                    started_at,
                    now,
                    input,
                    update.retry_count
                ],
            )?;

            insert_event(
                &tx,
                &update.mission_id,
                &format!("step_{}", update.status.as_str()),
                &json!({
                    "task_id": update.task_id,
                    "step_number": update.step_number,
                    "agent_id": update.agent_id,
                    "percentage": update.percentage,
                }),
            )?;
            recompute_mission(&tx, &update.mission_id)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Terminal step write: status `completed` (or `failed` when `error`
    /// is set), percentage 100, and the duration since `started_at`.
    pub async fn save_step_result(
        &self,
        mission_id: &str,
        task_id: &str,
        step_number: u32,
        result: Option<&Value>,
        metrics: &Value,
        error: Option<&str>,
    ) -> Result<()> {
        let mission_id = mission_id.to_string();
        let task_id = task_id.to_string();
        let output = result.map(to_json_text).transpose()?;
        let metrics = to_json_text(metrics)?;
        let error = error.map(str::to_string);
        let status = if error.is_some() {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };

        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let now_text = now.to_rfc3339();

            let started_at: Option<Option<String>> = tx
                .query_row(
                    "SELECT started_at FROM step_progress
                     WHERE mission_id = ?1 AND task_id = ?2 AND step_number = ?3",
                    params![mission_id, task_id, step_number],
                    |row| row.get(0),
                )
                .optional()?;
            let duration_ms = started_at
                .flatten()
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|start| (now - start.with_timezone(&Utc)).num_milliseconds().max(0))
                .unwrap_or(0);

            tx.execute(
                "INSERT INTO step_progress
                    (mission_id, task_id, step_number, status, progress_percentage, started_at,
                     updated_at, completed_at, duration_ms, output_data, error_message, metrics)
                 VALUES (?1, ?2, ?3, ?4, 100, ?5, ?5, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(mission_id, task_id, step_number) DO UPDATE SET
                    status = excluded.status,
                    progress_percentage = 100,
                    started_at = COALESCE(step_progress.started_at, excluded.started_at),
                    updated_at = excluded.updated_at,
                    completed_at = excluded.completed_at,
                    duration_ms = excluded.duration_ms,
                    output_data = excluded.output_data,
                    error_message = excluded.error_message,
                    metrics = excluded.metrics",
                params![
                    mission_id,
                    task_id,
                    step_number,
                    status.as_str(),
                    now_text,
                    duration_ms,
                    output,
                    error,
                    metrics
                ],
            )?;

            insert_event(
                &tx,
                &mission_id,
                &format!("step_{}", status.as_str()),
                &json!({
                    "task_id": task_id,
                    "step_number": step_number,
                    "duration_ms": duration_ms,
                    "error": error,
                }),
            )?;
            recompute_mission(&tx, &mission_id)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Explicitly set the mission status and write `mission_<status>`.
    pub async fn set_mission_status(
        &self,
        mission_id: &str,
        status: MissionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mission_id = mission_id.to_string();
        let error = error.map(str::to_string);
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let now = now_string();
            let completed_at = status.is_terminal().then(|| now.clone());
            let updated = tx.execute(
                "UPDATE mission_progress
                 SET status = ?2, updated_at = ?3, completed_at = COALESCE(?4, completed_at)
                 WHERE mission_id = ?1",
                params![mission_id, status.as_str(), now, completed_at],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("mission {}", mission_id)));
            }
            insert_event(
                &tx,
                &mission_id,
                &format!("mission_{}", status.as_str()),
                &json!({ "error": error }),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn save_checkpoint(&self, mission_id: &str, name: &str, data: &Value) -> Result<i64> {
        let mission_id = mission_id.to_string();
        let name = name.to_string();
        let data = to_json_text(data)?;
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO progress_checkpoints (mission_id, name, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![mission_id, name, data, now_string()],
            )?;
            let id = tx.last_insert_rowid();
            insert_event(&tx, &mission_id, "checkpoint_saved", &json!({ "name": name, "id": id }))?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    pub async fn get_latest_checkpoint(&self, mission_id: &str) -> Result<Option<Checkpoint>> {
        let mission_id = mission_id.to_string();
        with_conn(&self.conn, move |conn| {
            let checkpoint = conn
                .query_row(
                    "SELECT id, mission_id, name, data, created_at FROM progress_checkpoints
                     WHERE mission_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![mission_id],
                    |row| {
                        Ok(Checkpoint {
                            id: row.get(0)?,
                            mission_id: row.get(1)?,
                            name: row.get(2)?,
                            data: from_json_text(row.get(3)?).unwrap_or(Value::Null),
                            created_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(checkpoint)
        })
        .await
    }

    pub async fn log_agent_activity(
        &self,
        mission_id: &str,
        agent_id: &str,
        activity_type: &str,
        details: &Value,
    ) -> Result<()> {
        let mission_id = mission_id.to_string();
        let agent_id = agent_id.to_string();
        let activity_type = activity_type.to_string();
        let details = to_json_text(details)?;
        with_conn(&self.conn, move |conn| {
            conn.execute(
                "INSERT INTO agent_activity (mission_id, agent_id, activity_type, details, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![mission_id, agent_id, activity_type, details, now_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Oldest first.
    pub async fn get_agent_activity(&self, mission_id: &str) -> Result<Vec<AgentActivity>> {
        let mission_id = mission_id.to_string();
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, activity_type, details, timestamp FROM agent_activity
                 WHERE mission_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![mission_id], |row| {
                    Ok(AgentActivity {
                        agent_id: row.get(0)?,
                        activity_type: row.get(1)?,
                        details: from_json_text(row.get(2)?),
                        timestamp: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn save_metric(
        &self,
        mission_id: &str,
        metric_type: &str,
        value: f64,
        metadata: Option<&Value>,
    ) -> Result<()> {
        let mission_id = mission_id.to_string();
        let metric_type = metric_type.to_string();
        let metadata = metadata.map(to_json_text).transpose()?;
        with_conn(&self.conn, move |conn| {
            conn.execute(
                "INSERT INTO performance_metrics (mission_id, metric_type, value, metadata, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![mission_id, metric_type, value, metadata, now_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Metric points grouped by metric type, each group oldest first.
    pub async fn get_metrics(&self, mission_id: &str) -> Result<HashMap<String, Vec<MetricPoint>>> {
        let mission_id = mission_id.to_string();
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT metric_type, value, metadata, recorded_at FROM performance_metrics
                 WHERE mission_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![mission_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    MetricPoint {
                        value: row.get(1)?,
                        metadata: from_json_text(row.get(2)?),
                        recorded_at: row.get(3)?,
                    },
                ))
            })?;
            let mut grouped: HashMap<String, Vec<MetricPoint>> = HashMap::new();
            for row in rows {
                let (metric_type, point) = row?;
                grouped.entry(metric_type).or_default().push(point);
            }
            Ok(grouped)
        })
        .await
    }

    pub async fn get_mission_progress(&self, mission_id: &str) -> Result<MissionProgress> {
        let mission_id = mission_id.to_string();
        with_conn(&self.conn, move |conn| {
            let mission = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM mission_progress WHERE mission_id = ?1",
                        MISSION_COLUMNS
                    ),
                    params![mission_id],
                    row_to_mission,
                )
                .optional()?
                .ok_or_else(|| Error::NotFound(format!("mission {}", mission_id)))?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM step_progress WHERE mission_id = ?1 ORDER BY step_number, id",
                STEP_COLUMNS
            ))?;
            let steps = stmt
                .query_map(params![mission_id], row_to_step)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(MissionProgress { mission, steps })
        })
        .await
    }

    /// All mission rows, most recently updated first.
    pub async fn list_missions(&self, limit: usize) -> Result<Vec<MissionProgressRecord>> {
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mission_progress ORDER BY updated_at DESC LIMIT ?1",
                MISSION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_mission)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Newest first.
    pub async fn get_recent_events(&self, mission_id: &str, limit: usize) -> Result<Vec<ProgressEvent>> {
        let mission_id = mission_id.to_string();
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_type, data, timestamp FROM progress_events
                 WHERE mission_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![mission_id, limit as i64], |row| {
                    Ok(ProgressEvent {
                        id: row.get(0)?,
                        event_type: row.get(1)?,
                        data: from_json_text(row.get(2)?),
                        timestamp: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Delete a mission and everything attached to it.
    pub async fn delete_mission(&self, mission_id: &str) -> Result<()> {
        let mission_id = mission_id.to_string();
        with_conn(&self.conn, move |conn| {
            let deleted = conn.execute(
                "DELETE FROM mission_progress WHERE mission_id = ?1",
                params![mission_id],
            )?;
            if deleted == 0 {
                return Err(Error::NotFound(format!("mission {}", mission_id)));
            }
            Ok(())
        })
        .await
    }

    #[cfg(test)]
    async fn count_rows(&self, table: &'static str, mission_id: &str) -> i64 {
        let mission_id = mission_id.to_string();
        with_conn(&self.conn, move |conn| {
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE mission_id = ?1", table),
                params![mission_id],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap()
    }
}

fn insert_event(conn: &Connection, mission_id: &str, event_type: &str, data: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO progress_events (mission_id, event_type, data, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![mission_id, event_type, to_json_text(data)?, now_string()],
    )?;
    Ok(())
}

/// Roll the step rows up into the mission row.
fn recompute_mission(conn: &Connection, mission_id: &str) -> Result<()> {
    let (rows, completed, failed, active, average): (i64, i64, i64, i64, f64) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status NOT IN ('completed', 'failed', 'cancelled')), 0),
                COALESCE(AVG(progress_percentage), 0)
         FROM step_progress WHERE mission_id = ?1",
        params![mission_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )?;
    if rows == 0 {
        return Ok(());
    }

    let current: String = conn.query_row(
        "SELECT status FROM mission_progress WHERE mission_id = ?1",
        params![mission_id],
        |row| row.get(0),
    )?;
    let current = MissionStatus::parse(&current);
    let status = if current == MissionStatus::Cancelled {
        current
    } else {
        rollup_status(rows, completed, active)
    };
    let now = now_string();
    let completed_at = status.is_terminal().then(|| now.clone());

    conn.execute(
        "UPDATE mission_progress SET
            status = ?2,
            total_tasks = MAX(total_tasks, ?3),
            completed_tasks = ?4,
            failed_tasks = ?5,
            progress_percentage = ?6,
            updated_at = ?7,
            completed_at = COALESCE(?8, completed_at)
         WHERE mission_id = ?1",
        params![
            mission_id,
            status.as_str(),
            rows,
            completed,
            failed,
            average,
            now,
            completed_at
        ],
    )?;
    Ok(())
}

/// Mission status implied by its step rows.
fn rollup_status(rows: i64, completed: i64, active: i64) -> MissionStatus {
    if active > 0 {
        MissionStatus::Executing
    } else if completed == rows {
        MissionStatus::Completed
    } else if completed > 0 {
        MissionStatus::PartialFailure
    } else {
        MissionStatus::Failed
    }
}

fn row_to_mission(row: &Row<'_>) -> rusqlite::Result<MissionProgressRecord> {
    Ok(MissionProgressRecord {
        mission_id: row.get(0)?,
        goal: row.get(1)?,
        strategy_type: row.get(2)?,
        strategy: from_json_text(row.get(3)?),
        status: MissionStatus::parse(&row.get::<_, String>(4)?),
        total_tasks: row.get(5)?,
        completed_tasks: row.get(6)?,
        failed_tasks: row.get(7)?,
        progress_percentage: row.get(8)?,
        started_at: row.get(9)?,
        updated_at: row.get(10)?,
        completed_at: row.get(11)?,
        metadata: from_json_text(row.get(12)?).unwrap_or(Value::Null),
    })
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<StepProgressRecord> {
    Ok(StepProgressRecord {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        task_id: row.get(2)?,
        agent_id: row.get(3)?,
        step_number: row.get(4)?,
        description: row.get(5)?,
        status: StepStatus::parse(&row.get::<_, String>(6)?),
        progress_percentage: row.get(7)?,
        started_at: row.get(8)?,
        updated_at: row.get(9)?,
        completed_at: row.get(10)?,
        duration_ms: row.get(11)?,
        input_data: from_json_text(row.get(12)?),
        output_data: from_json_text(row.get(13)?),
        error_message: row.get(14)?,
        retry_count: row.get(15)?,
        metrics: from_json_text(row.get(16)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, tasks: usize) -> MissionEntry {
        MissionEntry {
            mission_id: id.to_string(),
            goal: "do things".to_string(),
            strategy_type: Some("parallel".to_string()),
            strategy: Some(json!({"type": "parallel"})),
            status: MissionStatus::Executing,
            total_tasks: tasks,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn percentage_is_mean_of_steps_and_status_follows_steps() {
        let store = ProgressStore::in_memory().unwrap();
        store.save_mission_progress(&entry("m", 2)).await.unwrap();

        store
            .update_step_progress(StepUpdate::new("m", "t1", 1, StepStatus::Executing, 25.0).agent("a1"))
            .await
            .unwrap();
        store
            .update_step_progress(StepUpdate::new("m", "t2", 2, StepStatus::Pending, 0.0))
            .await
            .unwrap();

        let progress = store.get_mission_progress("m").await.unwrap();
        assert_eq!(progress.mission.status, MissionStatus::Executing);
        assert!((progress.mission.progress_percentage - 12.5).abs() < 1e-9);
        assert!(progress.steps[0].started_at.is_some());
        assert!(progress.steps[1].started_at.is_none());

        store
            .save_step_result("m", "t1", 1, Some(&json!({"sum": 5})), &json!({"tool_calls": 1}), None)
            .await
            .unwrap();
        store
            .save_step_result("m", "t2", 2, None, &json!({}), Some("boom"))
            .await
            .unwrap();

        let progress = store.get_mission_progress("m").await.unwrap();
        assert_eq!(progress.mission.status, MissionStatus::PartialFailure);
        assert_eq!(progress.mission.completed_tasks, 1);
        assert_eq!(progress.mission.failed_tasks, 1);
        assert!((progress.mission.progress_percentage - 100.0).abs() < 1e-9);
        assert_eq!(progress.steps[0].output_data, Some(json!({"sum": 5})));
        assert!(progress.steps[0].duration_ms.unwrap() >= 0);
        assert_eq!(progress.steps[1].error_message.as_deref(), Some("boom"));
        assert!(progress.mission.completed_at.is_some());
    }

    #[tokio::test]
    async fn all_completed_means_completed_and_all_failed_means_failed() {
        let store = ProgressStore::in_memory().unwrap();
        store.save_mission_progress(&entry("ok", 1)).await.unwrap();
        store.save_step_result("ok", "t1", 1, None, &json!({}), None).await.unwrap();
        let ok = store.get_mission_progress("ok").await.unwrap();
        assert_eq!(ok.mission.status, MissionStatus::Completed);

        store.save_mission_progress(&entry("bad", 1)).await.unwrap();
        store.save_step_result("bad", "t1", 1, None, &json!({}), Some("x")).await.unwrap();
        let bad = store.get_mission_progress("bad").await.unwrap();
        assert_eq!(bad.mission.status, MissionStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_mission_is_sticky() {
        let store = ProgressStore::in_memory().unwrap();
        store.save_mission_progress(&entry("m", 1)).await.unwrap();
        store
            .update_step_progress(StepUpdate::new("m", "t1", 1, StepStatus::Working, 0.0))
            .await
            .unwrap();
        store
            .set_mission_status("m", MissionStatus::Cancelled, None)
            .await
            .unwrap();
        store.save_step_result("m", "t1", 1, None, &json!({}), None).await.unwrap();

        let progress = store.get_mission_progress("m").await.unwrap();
        assert_eq!(progress.mission.status, MissionStatus::Cancelled);
        let events = store.get_recent_events("m", 10).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "mission_cancelled"));
    }

    #[tokio::test]
    async fn events_are_newest_first() {
        let store = ProgressStore::in_memory().unwrap();
        store.save_mission_progress(&entry("m", 1)).await.unwrap();
        store.save_mission_progress(&entry("m", 1)).await.unwrap();
        store
            .update_step_progress(StepUpdate::new("m", "t1", 1, StepStatus::Working, 0.0))
            .await
            .unwrap();
        store.save_checkpoint("m", "after_t1", &json!({"k": 1})).await.unwrap();

        let events = store.get_recent_events("m", 10).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["checkpoint_saved", "step_working", "mission_updated", "mission_started"]
        );
        assert_eq!(store.get_recent_events("m", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn latest_checkpoint_wins() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.db")).await.unwrap();
        store.save_mission_progress(&entry("m", 1)).await.unwrap();
        assert!(store.get_latest_checkpoint("m").await.unwrap().is_none());

        store.save_checkpoint("m", "one", &json!({"n": 1})).await.unwrap();
        store.save_checkpoint("m", "two", &json!({"n": 2})).await.unwrap();
        let latest = store.get_latest_checkpoint("m").await.unwrap().unwrap();
        assert_eq!(latest.name, "two");
        assert_eq!(latest.data, json!({"n": 2}));
    }

    #[tokio::test]
    async fn checkpoint_requires_mission() {
        let store = ProgressStore::in_memory().unwrap();
        let err = store.save_checkpoint("ghost", "x", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn metrics_are_grouped_by_type() {
        let store = ProgressStore::in_memory().unwrap();
        store.save_mission_progress(&entry("m", 1)).await.unwrap();
        store.save_metric("m", "tokens", 10.0, None).await.unwrap();
        store.save_metric("m", "latency_ms", 250.0, Some(&json!({"task": "t1"}))).await.unwrap();
        store.save_metric("m", "tokens", 32.0, None).await.unwrap();

        let metrics = store.get_metrics("m").await.unwrap();
        let tokens: Vec<f64> = metrics["tokens"].iter().map(|p| p.value).collect();
        assert_eq!(tokens, vec![10.0, 32.0]);
        assert_eq!(metrics["latency_ms"][0].metadata, Some(json!({"task": "t1"})));
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let store = ProgressStore::in_memory().unwrap();
        store.save_mission_progress(&entry("m", 1)).await.unwrap();
        store
            .update_step_progress(StepUpdate::new("m", "t1", 1, StepStatus::Working, 0.0))
            .await
            .unwrap();
        store.save_checkpoint("m", "c", &json!({})).await.unwrap();
        store.log_agent_activity("m", "agent-1", "assigned", &json!({"task": "t1"})).await.unwrap();
        store.save_metric("m", "tokens", 1.0, None).await.unwrap();

        store.delete_mission("m").await.unwrap();
        for table in [
            "step_progress",
            "progress_checkpoints",
            "progress_events",
            "agent_activity",
            "performance_metrics",
        ] {
            assert_eq!(store.count_rows(table, "m").await, 0, "{} not cleared", table);
        }
        assert!(matches!(store.get_mission_progress("m").await, Err(Error::NotFound(_))));
    }

    #[test]
    fn rollup_rules() {
        assert_eq!(rollup_status(3, 1, 1), MissionStatus::Executing);
        assert_eq!(rollup_status(2, 2, 0), MissionStatus::Completed);
        assert_eq!(rollup_status(2, 1, 0), MissionStatus::PartialFailure);
        assert_eq!(rollup_status(2, 0, 0), MissionStatus::Failed);
    }
}
