//! SQLite-backed plan and progress stores.
//!
//! Each store owns a single connection behind an async mutex; every call
//! runs on the blocking pool and holds the lock for its whole transaction,
//! so writes are serialized per store.

mod plans;
mod progress;

pub use plans::{plan_id_for, ExecutionRecord, ExecutionStatus, PlanRecord, PlanStore};
pub use progress::{
    AgentActivity, Checkpoint, MetricPoint, MissionEntry, MissionProgress, MissionProgressRecord,
    ProgressEvent, ProgressStore, StepProgressRecord, StepStatus, StepUpdate,
};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

type SharedConnection = Arc<Mutex<Connection>>;

/// Open (or create) a database file and apply `schema`.
async fn open_database(path: &Path, schema: &'static str) -> Result<SharedConnection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Store(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    let path = path.to_path_buf();
    let conn = tokio::task::spawn_blocking(move || {
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(schema)?;
        Ok::<_, Error>(conn)
    })
    .await??;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Open a private in-memory database and apply `schema`.
fn open_memory(schema: &'static str) -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(schema)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Run `f` against the locked connection on the blocking pool.
async fn with_conn<T, F>(conn: &SharedConnection, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut conn = conn.blocking_lock();
        f(&mut conn)
    })
    .await?
}

fn to_json_text(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON column; corrupt text is logged and read as absent.
fn from_json_text(text: Option<String>) -> Option<Value> {
    let text = text?;
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring corrupt JSON column ({} bytes): {}", text.len(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_columns_decode_or_read_as_absent() {
        assert_eq!(from_json_text(Some(r#"{"a":1}"#.to_string())), Some(json!({"a": 1})));
        assert_eq!(from_json_text(Some("{not json".to_string())), None);
        assert_eq!(from_json_text(None), None);
    }
}
