//! Submission, upload and status operations behind the HTTP surface.

use crate::config::StorageSettings;
use crate::metrics::{MetricsSnapshot, TaskMetrics};
use crate::storage::{DocumentRef, DocumentUploader, FetchError, UploadError, upload_key};
use crate::tasks::{InputError, PhaseCount, StoreError, TaskId, TaskInput, TaskStore, TaskView};
use crate::worker::Dispatcher;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use time::OffsetDateTime;

/// Errors surfaced directly to API callers; none of them touch task state.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// Submission had neither or both inputs.
    #[error(transparent)]
    Input(#[from] InputError),
    /// The document reference is malformed or unsafe.
    #[error(transparent)]
    InvalidReference(FetchError),
    /// No task with this id exists.
    #[error("task not found: {0}")]
    NotFound(TaskId),
    /// The task store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An upload carried no bytes.
    #[error("uploaded file is empty")]
    EmptyUpload,
    /// An upload is larger than any document the fetcher would accept.
    #[error("uploaded file exceeds {limit} bytes")]
    UploadTooLarge {
        /// Configured byte limit.
        limit: usize,
    },
    /// Storage rejected or failed the upload.
    #[error("storage failed: {0}")]
    Upload(#[from] UploadError),
}

/// Counters plus the structuring call audit, served by `GET /metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    /// In-process task and extraction counters.
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    /// Persisted structuring calls grouped by phase.
    pub llm_calls: Vec<PhaseCount>,
}

/// A file received from a caller, not yet stored.
#[derive(Debug, Clone)]
pub struct IncomingDocument {
    /// File name as sent by the client.
    pub original_name: String,
    /// MIME type as sent by the client.
    pub content_type: Option<String>,
    /// File contents.
    pub bytes: Bytes,
}

/// Where an upload landed; `file_path` is accepted as `resumeFileUrl` on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedDocument {
    /// Object key inside `bucket`.
    pub file_path: String,
    /// Bucket holding the object.
    pub bucket: String,
    /// File name as sent by the client.
    pub original_name: String,
}

/// Operations the HTTP router needs; tests substitute a stub.
#[async_trait]
pub trait IntakeApi: Send + Sync {
    /// Create a `pending` task, dispatch it and return its id without waiting.
    async fn submit(&self, input: TaskInput) -> Result<TaskId, IntakeError>;

    /// Point lookup of a task's status, result and error.
    async fn status(&self, id: TaskId) -> Result<TaskView, IntakeError>;

    /// Store a resume in the default bucket under a fresh `resume_<millis>.<ext>` key.
    async fn upload(&self, document: IncomingDocument) -> Result<UploadedDocument, IntakeError>;

    /// Largest accepted upload in bytes.
    fn upload_limit(&self) -> usize;

    /// Current counters and the structuring call audit.
    async fn metrics(&self) -> Result<MetricsReport, IntakeError>;
}

/// Production [`IntakeApi`] over a task store, dispatcher and storage uploader.
pub struct IntakeService {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<TaskMetrics>,
    uploader: Arc<dyn DocumentUploader>,
    storage: StorageSettings,
}

impl IntakeService {
    /// Wire the service; `storage` validates references and bounds uploads.
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<TaskMetrics>,
        uploader: Arc<dyn DocumentUploader>,
        storage: StorageSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            uploader,
            storage,
        }
    }
}

#[async_trait]
impl IntakeApi for IntakeService {
    async fn submit(&self, input: TaskInput) -> Result<TaskId, IntakeError> {
        if let TaskInput::DocumentRef(raw) = &input {
            DocumentRef::parse(raw, &self.storage).map_err(IntakeError::InvalidReference)?;
        }
        let record = self.store.create(input).await?;
        self.metrics.record_submitted();
        tracing::info!(
            task_id = %record.id,
            has_document = record.document_ref.is_some(),
            "Task submitted"
        );
        self.dispatcher.dispatch(record.id);
        Ok(record.id)
    }

    async fn status(&self, id: TaskId) -> Result<TaskView, IntakeError> {
        self.store
            .get(id)
            .await?
            .map(|record| record.view())
            .ok_or(IntakeError::NotFound(id))
    }

    async fn upload(&self, document: IncomingDocument) -> Result<UploadedDocument, IntakeError> {
        if document.bytes.is_empty() {
            return Err(IntakeError::EmptyUpload);
        }
        let limit = self.upload_limit();
        if document.bytes.len() > limit {
            return Err(IntakeError::UploadTooLarge { limit });
        }

        let unix_millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let location = DocumentRef {
            bucket: self.storage.default_bucket.clone(),
            key: upload_key(&document.original_name, unix_millis),
        };
        tracing::info!(
            document = %location,
            original_name = %document.original_name,
            size = document.bytes.len(),
            "Uploading document"
        );

        let started = Instant::now();
        let mime = document.content_type.as_deref();
        let upload = self.uploader.upload(&location, mime, document.bytes);
        tokio::time::timeout(self.storage.fetch_timeout, upload)
            .await
            .map_err(|_| UploadError::Timeout {
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })??;

        Ok(UploadedDocument {
            file_path: location.key,
            bucket: location.bucket,
            original_name: document.original_name,
        })
    }

    fn upload_limit(&self) -> usize {
        self.storage.max_document_bytes
    }

    async fn metrics(&self) -> Result<MetricsReport, IntakeError> {
        Ok(MetricsReport {
            counters: self.metrics.snapshot(),
            llm_calls: self.store.llm_calls_by_phase().await?,
        })
    }
}
