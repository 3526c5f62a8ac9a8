//! Durable plans, their steps, and execution records (`plans.db`).

use std::path::Path;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{from_json_text, open_database, open_memory, to_json_text, with_conn, SharedConnection};
use crate::error::{Error, Result};
use crate::plan::Plan;
use crate::util::now_string;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY NOT NULL,
    request TEXT NOT NULL,
    goal TEXT NOT NULL,
    output_format TEXT NOT NULL DEFAULT '',
    plan_json TEXT NOT NULL,
    file_path TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    executed_at TEXT,
    execution_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_plans_created_at ON plans(created_at);
CREATE INDEX IF NOT EXISTS idx_plans_status ON plans(status);

CREATE TABLE IF NOT EXISTS plan_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plan_id TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    tool TEXT NOT NULL,
    arguments TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    expected_output TEXT NOT NULL DEFAULT '',
    depends_on TEXT NOT NULL DEFAULT '[]',
    FOREIGN KEY (plan_id) REFERENCES plans(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_plan_steps_plan ON plan_steps(plan_id);

CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plan_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    results TEXT,
    error_message TEXT,
    FOREIGN KEY (plan_id) REFERENCES plans(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_executions_plan ON executions(plan_id);
"#;

const SEARCH_LIMIT: i64 = 50;

const PLAN_COLUMNS: &str = "p.id, p.request, p.goal, p.output_format, p.file_path, p.status, \
     p.created_at, p.executed_at, p.execution_count, \
     (SELECT COUNT(*) FROM plan_steps s WHERE s.plan_id = p.id)";

/// Status of one plan execution. Also mirrored onto the plan header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Running,
        }
    }
}

/// Header row of a stored plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanRecord {
    pub id: String,
    pub request: String,
    pub goal: String,
    pub output_format: String,
    pub file_path: Option<String>,
    /// `pending`, `executing`, `completed` or `failed`
    pub status: String,
    pub created_at: String,
    pub executed_at: Option<String>,
    pub execution_count: u32,
    pub step_count: u32,
}

/// One run of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: i64,
    pub plan_id: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: ExecutionStatus,
    pub results: Option<Value>,
    pub error_message: Option<String>,
}

/// Content address of a plan: first 16 hex chars of SHA-256 over the
/// plan JSON (which includes the request).
pub fn plan_id_for(plan: &Plan) -> Result<String> {
    let canonical = serde_json::to_string(plan)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest)[..16].to_string())
}

/// SQLite store for plans and their executions.
#[derive(Clone)]
pub struct PlanStore {
    conn: SharedConnection,
}

impl PlanStore {
    /// Open or create the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(path.as_ref(), SCHEMA).await?;
        tracing::info!("Plan store opened at {}", path.as_ref().display());
        Ok(Self { conn })
    }

    /// Private in-memory store.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: open_memory(SCHEMA)?,
        })
    }

    /// Insert the plan header and each step in one transaction.
    pub async fn save_plan(&self, plan_id: &str, plan: &Plan, file_path: Option<&Path>) -> Result<()> {
        let plan_id = plan_id.to_string();
        let plan = plan.clone();
        let plan_json = serde_json::to_string(&plan)?;
        let file_path = file_path.map(|p| p.to_string_lossy().into_owned());

        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM plans WHERE id = ?1)",
                params![plan_id],
                |row| row.get(0),
            )?;
            if exists {
                return Err(Error::AlreadyExists(format!("plan {}", plan_id)));
            }

            tx.execute(
                "INSERT INTO plans (id, request, goal, output_format, plan_json, file_path, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                params![
                    plan_id,
                    plan.request,
                    plan.goal,
                    plan.output_format,
                    plan_json,
                    file_path,
                    now_string()
                ],
            )?;
            for step in &plan.steps {
                tx.execute(
                    "INSERT INTO plan_steps (plan_id, step_number, tool, arguments, description, expected_output, depends_on)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        plan_id,
                        step.step_number,
                        step.tool,
                        serde_json::to_string(&step.arguments)?,
                        step.description,
                        step.expected_output,
                        serde_json::to_string(&step.depends_on)?
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Load a plan; steps come back from the stored JSON blob so argument
    /// types survive unchanged.
    pub async fn get_plan(&self, plan_id: &str) -> Result<Plan> {
        let plan_id = plan_id.to_string();
        let plan_json: String = with_conn(&self.conn, move |conn| {
            conn.query_row(
                "SELECT plan_json FROM plans WHERE id = ?1",
                params![plan_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("plan {}", plan_id)))
        })
        .await?;
        Plan::from_json(&plan_json)
    }

    pub async fn get_plan_record(&self, plan_id: &str) -> Result<PlanRecord> {
        let plan_id = plan_id.to_string();
        with_conn(&self.conn, move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM plans p WHERE p.id = ?1", PLAN_COLUMNS),
                params![plan_id],
                row_to_plan,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("plan {}", plan_id)))
        })
        .await
    }

    /// Most recent first.
    pub async fn list_plans(&self, limit: usize, offset: usize) -> Result<Vec<PlanRecord>> {
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM plans p ORDER BY p.created_at DESC, p.rowid DESC LIMIT ?1 OFFSET ?2",
                PLAN_COLUMNS
            ))?;
            let plans = stmt
                .query_map(params![limit as i64, offset as i64], row_to_plan)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(plans)
        })
        .await
    }

    /// Case-insensitive substring match on id, request or goal.
    pub async fn search_plans(&self, term: &str) -> Result<Vec<PlanRecord>> {
        let term = term.to_lowercase();
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM plans p
                 WHERE instr(lower(p.id), ?1) > 0
                    OR instr(lower(p.request), ?1) > 0
                    OR instr(lower(p.goal), ?1) > 0
                 ORDER BY p.created_at DESC, p.rowid DESC LIMIT ?2",
                PLAN_COLUMNS
            ))?;
            let plans = stmt
                .query_map(params![term, SEARCH_LIMIT], row_to_plan)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(plans)
        })
        .await
    }

    /// Start an execution record and mark the plan as executing.
    pub async fn record_execution(&self, plan_id: &str) -> Result<i64> {
        let plan_id = plan_id.to_string();
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let now = now_string();
            let updated = tx.execute(
                "UPDATE plans SET execution_count = execution_count + 1,
                                  executed_at = ?2,
                                  status = 'executing'
                 WHERE id = ?1",
                params![plan_id, now],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("plan {}", plan_id)));
            }
            tx.execute(
                "INSERT INTO executions (plan_id, started_at, status) VALUES (?1, ?2, 'running')",
                params![plan_id, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    /// Finish an execution; `error` decides between `completed` and
    /// `failed`, and the plan header takes the same status.
    pub async fn complete_execution(
        &self,
        execution_id: i64,
        results: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let results = results.map(to_json_text).transpose()?;
        let error = error.map(str::to_string);
        let status = if error.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let plan_id: String = tx
                .query_row(
                    "SELECT plan_id FROM executions WHERE id = ?1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;

            tx.execute(
                "UPDATE executions SET completed_at = ?2, status = ?3, results = ?4, error_message = ?5
                 WHERE id = ?1",
                params![execution_id, now_string(), status.as_str(), results, error],
            )?;
            tx.execute(
                "UPDATE plans SET status = ?2 WHERE id = ?1",
                params![plan_id, status.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Newest first.
    pub async fn get_execution_history(&self, plan_id: &str) -> Result<Vec<ExecutionRecord>> {
        let plan_id = plan_id.to_string();
        with_conn(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, plan_id, started_at, completed_at, status, results, error_message
                 FROM executions WHERE plan_id = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt
                .query_map(params![plan_id], |row| {
                    Ok(ExecutionRecord {
                        id: row.get(0)?,
                        plan_id: row.get(1)?,
                        started_at: row.get(2)?,
                        completed_at: row.get(3)?,
                        status: ExecutionStatus::parse(&row.get::<_, String>(4)?),
                        results: from_json_text(row.get(5)?),
                        error_message: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Delete a plan with its steps and executions.
    pub async fn delete_plan(&self, plan_id: &str) -> Result<()> {
        let plan_id = plan_id.to_string();
        with_conn(&self.conn, move |conn| {
            let deleted = conn.execute("DELETE FROM plans WHERE id = ?1", params![plan_id])?;
            if deleted == 0 {
                return Err(Error::NotFound(format!("plan {}", plan_id)));
            }
            Ok(())
        })
        .await
    }

    #[cfg(test)]
    async fn count_rows(&self, table: &'static str, plan_id: &str) -> i64 {
        let plan_id = plan_id.to_string();
        with_conn(&self.conn, move |conn| {
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE plan_id = ?1", table),
                params![plan_id],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap()
    }
}

fn row_to_plan(row: &Row<'_>) -> rusqlite::Result<PlanRecord> {
    Ok(PlanRecord {
        id: row.get(0)?,
        request: row.get(1)?,
        goal: row.get(2)?,
        output_format: row.get(3)?,
        file_path: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        executed_at: row.get(7)?,
        execution_count: row.get(8)?,
        step_count: row.get(9)?,
    })
}
