//! Task record store: durable per-task state with atomic conditional transitions.
//!
//! All writes go through [`TaskStore::create`], [`TaskStore::claim`],
//! [`TaskStore::complete`] and [`TaskStore::fail`]. Terminal records are never rewritten.

mod memory;
mod sqlite;
pub mod types;

use crate::config::{TaskSettings, TaskStoreKind};
use crate::structuring::ResumeSummary;
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;
pub use types::{
    InputError, LlmCall, PhaseCount, StoreError, TaskId, TaskInput, TaskRecord, TaskStatus,
    TaskView,
};

/// Durable task records keyed by id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `pending` record.
    async fn create(&self, input: TaskInput) -> Result<TaskRecord, StoreError>;

    /// `pending → processing`; `Ok(false)` when the record is missing or not pending.
    async fn claim(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Point lookup.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Non-terminal `→ done`, storing `result` and clearing `error`.
    async fn complete(&self, id: TaskId, result: &ResumeSummary) -> Result<bool, StoreError>;

    /// Non-terminal `→ error`, storing `message` and clearing `result`.
    async fn fail(&self, id: TaskId, message: &str) -> Result<bool, StoreError>;

    /// Ids currently in `status`, oldest first.
    async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>, StoreError>;

    /// Append one structuring-model audit entry.
    async fn record_llm_call(&self, call: LlmCall) -> Result<(), StoreError>;

    /// Audit entries grouped by phase, sorted by phase name.
    async fn llm_calls_by_phase(&self) -> Result<Vec<PhaseCount>, StoreError>;
}

/// Open the store selected by configuration.
pub async fn open_store(settings: &TaskSettings) -> Result<Arc<dyn TaskStore>, StoreError> {
    match settings.store {
        TaskStoreKind::Memory => {
            tracing::warn!("Using in-memory task store; task records will not survive restarts");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
        TaskStoreKind::Sqlite => {
            let store = SqliteTaskStore::open(settings.db_path.clone()).await?;
            tracing::info!(path = %settings.db_path.display(), "Opened SQLite task store");
            Ok(Arc::new(store))
        }
    }
}
