use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use nodeflow_core::error::{FlowError, Result};
use nodeflow_core::traits::WorkflowStore;
use nodeflow_core::types::{RunSummary, Workflow};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        graph TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        summary TEXT NOT NULL,
        finished_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_workflow
        ON runs(workflow_id, finished_at);";

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

/// A stored workflow without its graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInfo {
    pub id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed workflow definitions and run history.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| FlowError::Database(e.to_string()))
    }

    /// All stored workflows, most recently updated first.
    pub fn list_workflows(&self) -> Result<Vec<WorkflowInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, updated_at FROM workflows ORDER BY updated_at DESC, id ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let ts: String = row.get(2)?;
                Ok((id, name, ts))
            })
            .map_err(db_err)?;

        let mut workflows = Vec::new();
        for row in rows {
            let (id, name, ts) = row.map_err(db_err)?;
            workflows.push(WorkflowInfo {
                id,
                name,
                updated_at: parse_timestamp(&ts),
            });
        }
        Ok(workflows)
    }

    /// Remove a workflow and its run history. Returns whether it existed.
    pub fn delete_workflow(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM runs WHERE workflow_id = ?1", params![id])
            .map_err(db_err)?;
        let removed = conn
            .execute("DELETE FROM workflows WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}

fn parse_timestamp(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl WorkflowStore for SqliteStore {
    fn load_workflow<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Workflow>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let row = conn
                .query_row(
                    "SELECT id, name, graph FROM workflows WHERE id = ?1",
                    params![id],
                    |row| {
                        let id: String = row.get(0)?;
                        let name: String = row.get(1)?;
                        let graph: String = row.get(2)?;
                        Ok((id, name, graph))
                    },
                )
                .optional()
                .map_err(db_err)?;

            match row {
                Some((id, name, graph)) => {
                    let graph = serde_json::from_str(&graph)?;
                    Ok(Some(Workflow { id, name, graph }))
                }
                None => Ok(None),
            }
        })
    }

    fn save_workflow<'a>(&'a self, workflow: &'a Workflow) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let graph = serde_json::to_string(&workflow.graph)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflows (id, name, graph, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    graph = excluded.graph,
                    updated_at = excluded.updated_at",
                params![workflow.id, workflow.name, graph, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            debug!(workflow_id = %workflow.id, "Workflow saved");
            Ok(())
        })
    }

    fn record_run<'a>(&'a self, summary: &'a RunSummary) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = serde_json::to_string(summary)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO runs (run_id, workflow_id, status, duration_ms, summary, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    summary.run_id.as_str(),
                    summary.workflow_id,
                    summary.status.to_string(),
                    summary.duration_ms as i64,
                    body,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            debug!(run_id = %summary.run_id, status = %summary.status, "Run recorded");
            Ok(())
        })
    }

    fn list_runs<'a>(
        &'a self,
        workflow_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<RunSummary>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT run_id, summary FROM runs
                     WHERE workflow_id = ?1
                     ORDER BY finished_at DESC, rowid DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![workflow_id, limit as i64], |row| {
                    let run_id: String = row.get(0)?;
                    let summary: String = row.get(1)?;
                    Ok((run_id, summary))
                })
                .map_err(db_err)?;

            let mut runs = Vec::new();
            for row in rows {
                let (run_id, summary) = row.map_err(db_err)?;
                match serde_json::from_str::<RunSummary>(&summary) {
                    Ok(summary) => runs.push(summary),
                    Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable run record"),
                }
            }
            Ok(runs)
        })
    }
}
