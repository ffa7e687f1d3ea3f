//! SQLite-backed task store. Every transition is one conditional `UPDATE`.

use super::{
    LlmCall, PhaseCount, StoreError, TaskId, TaskInput, TaskRecord, TaskStatus, TaskStore,
};
use crate::structuring::ResumeSummary;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;
use std::sync::Arc;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS resume_tasks (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'done', 'error')),
    resume_file_url TEXT,
    resume_text TEXT,
    result TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resume_tasks_status ON resume_tasks(status);

CREATE TABLE IF NOT EXISTS llm_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT,
    phase TEXT NOT NULL,
    model TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_llm_calls_phase ON llm_calls(phase);
"#;

const SELECT_COLUMNS: &str =
    "SELECT id, status, resume_file_url, resume_text, result, error, created_at FROM resume_tasks";

/// Durable task store backed by a single SQLite connection.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| {
                    StoreError::Worker(format!("failed to create {}: {error}", parent.display()))
                })?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|error| StoreError::Worker(error.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            operation(&conn)
        })
        .await
        .map_err(|error| StoreError::Worker(error.to_string()))?
    }

    async fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let now = now_rfc3339()?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE resume_tasks
                 SET status = ?2, result = ?3, error = ?4, updated_at = ?5
                 WHERE id = ?1 AND status IN ('pending', 'processing')",
                params![id.to_string(), status.as_str(), result, error, now],
            )?;
            Ok(updated == 1)
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, input: TaskInput) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::new_pending(input);
        let created_at = record
            .created_at
            .format(&Rfc3339)
            .map_err(|error| StoreError::Corrupt(error.to_string()))?;
        let row = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO resume_tasks
                 (id, status, resume_file_url, resume_text, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    row.id.to_string(),
                    row.status.as_str(),
                    row.document_ref,
                    row.text,
                    created_at
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn claim(&self, id: TaskId) -> Result<bool, StoreError> {
        let now = now_rfc3339()?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE resume_tasks SET status = 'processing', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), now],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let raw = self
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                        params![id.to_string()],
                        RawRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        raw.map(RawRow::into_record).transpose()
    }

    async fn complete(&self, id: TaskId, result: &ResumeSummary) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(result)?;
        self.finish(id, TaskStatus::Done, Some(payload), None).await
    }

    async fn fail(&self, id: TaskId, message: &str) -> Result<bool, StoreError> {
        self.finish(id, TaskStatus::Error, None, Some(message.to_string()))
            .await
    }

    async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>, StoreError> {
        let ids: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT id FROM resume_tasks WHERE status = ?1 ORDER BY rowid ASC")?;
                let ids = stmt
                    .query_map(params![status.as_str()], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await?;
        ids.iter().map(|id| parse_id(id)).collect()
    }

    async fn record_llm_call(&self, call: LlmCall) -> Result<(), StoreError> {
        let now = now_rfc3339()?;
        let latency_ms = i64::try_from(call.latency_ms).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO llm_calls
                 (task_id, phase, model, latency_ms, success, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    call.task_id.to_string(),
                    call.phase,
                    call.model,
                    latency_ms,
                    call.success,
                    call.error,
                    now
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn llm_calls_by_phase(&self) -> Result<Vec<PhaseCount>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT phase, COUNT(*), SUM(CASE WHEN success THEN 0 ELSE 1 END)
                 FROM llm_calls GROUP BY phase ORDER BY phase ASC",
            )?;
            let counts = stmt
                .query_map([], |row| {
                    let calls: i64 = row.get(1)?;
                    let failures: i64 = row.get(2)?;
                    Ok(PhaseCount {
                        phase: row.get(0)?,
                        calls: u64::try_from(calls).unwrap_or_default(),
                        failures: u64::try_from(failures).unwrap_or_default(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(counts)
        })
        .await
    }
}

struct RawRow {
    id: String,
    status: String,
    document_ref: Option<String>,
    text: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            document_ref: row.get(2)?,
            text: row.get(3)?,
            result: row.get(4)?,
            error: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(StoreError::Corrupt)?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str::<ResumeSummary>)
            .transpose()?;
        let created_at = OffsetDateTime::parse(&self.created_at, &Rfc3339)
            .map_err(|error| StoreError::Corrupt(format!("created_at: {error}")))?;
        Ok(TaskRecord {
            id: parse_id(&self.id)?,
            status,
            document_ref: self.document_ref,
            text: self.text,
            result,
            error: self.error,
            created_at,
        })
    }
}

fn parse_id(raw: &str) -> Result<TaskId, StoreError> {
    Uuid::parse_str(raw).map_err(|error| StoreError::Corrupt(format!("id {raw}: {error}")))
}

fn now_rfc3339() -> Result<String, StoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|error| StoreError::Corrupt(error.to_string()))
}
