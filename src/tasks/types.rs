//! Task record types, the status enum and its transition rules.

use crate::structuring::ResumeSummary;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque task identifier generated at creation.
pub type TaskId = Uuid;

/// Lifecycle state of a task: `pending → processing → {done | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a worker.
    Pending,
    /// Claimed by exactly one orchestrator run.
    Processing,
    /// Finished with a structured result.
    Done,
    /// Finished with an error message.
    Error,
}

impl TaskStatus {
    /// `done` and `error` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Column value persisted for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Submission rejected before a task was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    /// Neither a document reference nor literal text was supplied.
    #[error("either resumeFileUrl or resumeText is required")]
    Missing,
    /// Both a document reference and literal text were supplied.
    #[error("provide resumeFileUrl or resumeText, not both")]
    Ambiguous,
}

/// What a task starts from: exactly one of a storage reference or literal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskInput {
    /// Object storage reference (`key` or `bucket/key`).
    DocumentRef(String),
    /// Already extracted plain text.
    Text(String),
}

impl TaskInput {
    /// Validate raw submission fields; blank strings count as absent.
    pub fn from_parts(
        document_ref: Option<String>,
        text: Option<String>,
    ) -> Result<Self, InputError> {
        let document_ref = non_blank(document_ref);
        let text = non_blank(text);
        match (document_ref, text) {
            (Some(document_ref), None) => Ok(Self::DocumentRef(document_ref)),
            (None, Some(text)) => Ok(Self::Text(text)),
            (Some(_), Some(_)) => Err(InputError::Ambiguous),
            (None, None) => Err(InputError::Missing),
        }
    }

    pub(crate) fn document_ref(&self) -> Option<&str> {
        match self {
            Self::DocumentRef(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    pub(crate) fn text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::DocumentRef(_) => None,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

/// One persisted task row.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// Task identifier.
    pub id: TaskId,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Storage reference column.
    pub document_ref: Option<String>,
    /// Literal text column.
    pub text: Option<String>,
    /// Structured result; present only in `done`.
    pub result: Option<ResumeSummary>,
    /// Failure message; present only in `error`.
    pub error: Option<String>,
    /// Creation timestamp (UTC).
    pub created_at: OffsetDateTime,
}

impl TaskRecord {
    /// Fresh `pending` record for `input`.
    pub fn new_pending(input: TaskInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            document_ref: input.document_ref().map(str::to_string),
            text: input.text().map(str::to_string),
            result: None,
            error: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Input the orchestrator should work from; literal text wins if a row carries both.
    pub fn input(&self) -> Option<TaskInput> {
        let text = self
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let document_ref = self
            .document_ref
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        match (text, document_ref) {
            (Some(text), _) => Some(TaskInput::Text(text.to_string())),
            (None, Some(document_ref)) => Some(TaskInput::DocumentRef(document_ref.to_string())),
            (None, None) => None,
        }
    }

    /// Read-only projection returned to pollers.
    pub fn view(&self) -> TaskView {
        TaskView {
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Status poll response: `{status, result, error}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Structured result when `done`.
    pub result: Option<ResumeSummary>,
    /// Failure message when `error`.
    pub error: Option<String>,
}

/// Audit entry for one call to the structuring model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmCall {
    /// Task the call was made for.
    pub task_id: TaskId,
    /// Pipeline step that issued the call (`parse` for resume structuring).
    pub phase: String,
    /// Model identifier reported by the client.
    pub model: String,
    /// Wall-clock latency including the timeout, if it fired.
    pub latency_ms: u64,
    /// Whether the call returned output.
    pub success: bool,
    /// Failure message when `success` is false.
    pub error: Option<String>,
}

/// Number of recorded model calls for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseCount {
    /// Phase name as recorded on [`LlmCall::phase`].
    pub phase: String,
    /// Calls recorded for the phase.
    pub calls: u64,
    /// Calls among `calls` that failed.
    pub failures: u64,
}

/// Errors raised by a task store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected a statement.
    #[error("task database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Result payload could not be encoded or decoded.
    #[error("task payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A stored row violates the schema (unknown status, bad id, bad timestamp).
    #[error("corrupt task row: {0}")]
    Corrupt(String),
    /// The blocking database worker failed.
    #[error("task store worker failed: {0}")]
    Worker(String),
}
