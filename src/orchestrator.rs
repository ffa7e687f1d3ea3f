//! Task orchestrator: drive one claimed task to a terminal state.
//!
//! `run` claims the task, then executes fetch → extract → structure → parse. Every
//! error, timeout and panic in that chain ends in exactly one `complete` or `fail`
//! write, so a claimed task never stays `processing`.

use crate::extraction::{EngineSelector, ExtractionError};
use crate::metrics::TaskMetrics;
use crate::storage::{BinaryFetcher, FetchError};
use crate::structuring::{
    ParseError, ResumeSummary, StructuringClient, StructuringError, parse_resume_summary,
};
use crate::tasks::{LlmCall, TaskId, TaskInput, TaskStore};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failures inside a running task; the `Display` text becomes the task's `error`.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The record carries neither text nor a document reference.
    #[error("task has neither resume text nor a document reference")]
    MissingInput,
    /// Downloading the document failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// No engine produced text.
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    /// The structuring collaborator failed or returned nothing.
    #[error("structuring failed: {0}")]
    Downstream(#[from] StructuringError),
    /// The structuring collaborator exceeded its timeout.
    #[error("structuring failed: timed out after {0} ms")]
    DownstreamTimeout(u64),
    /// Structuring output did not match the schema, even after repair.
    #[error("structuring output rejected: {0}")]
    Parse(#[from] ParseError),
    /// The service is shutting down.
    #[error("cancelled by service shutdown")]
    Cancelled,
    /// An invariant was violated (vanished record, store failure, panic).
    #[error("internal error: {0}")]
    Internal(String),
}

/// What a single `run` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another runner owned the task, or it was not pending.
    Skipped,
    /// Shutdown had already begun; the task was left `pending` for the next start.
    Deferred,
    /// The claim itself could not be attempted; the task stays `pending`.
    ClaimFailed(String),
    /// The task reached `done`.
    Completed,
    /// The task reached `error` with this message.
    Failed(String),
    /// The record was already terminal when this run tried to finish it; nothing was written.
    AlreadyTerminal,
}

/// Phase recorded in the call audit for resume structuring.
pub const STRUCTURING_PHASE: &str = "parse";

/// Collaborators the orchestrator strings together.
pub struct TaskOrchestrator {
    store: Arc<dyn TaskStore>,
    fetcher: BinaryFetcher,
    selector: EngineSelector,
    structurer: Arc<dyn StructuringClient>,
    structuring_timeout: Duration,
    metrics: Arc<TaskMetrics>,
    shutdown: CancellationToken,
}

impl TaskOrchestrator {
    /// Wire an orchestrator from its collaborators.
    pub fn new(
        store: Arc<dyn TaskStore>,
        fetcher: BinaryFetcher,
        selector: EngineSelector,
        structurer: Arc<dyn StructuringClient>,
        structuring_timeout: Duration,
        metrics: Arc<TaskMetrics>,
    ) -> Self {
        Self {
            store,
            fetcher,
            selector,
            structurer,
            structuring_timeout,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight runs when cancelled.
    ///
    /// Once cancelled, later `run` calls leave their task `pending` without claiming it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drive task `id` from `pending` to `done` or `error`.
    ///
    /// Safe to call concurrently for the same id: only the run that wins the claim does work.
    pub async fn run(&self, id: TaskId) -> RunOutcome {
        if self.shutdown.is_cancelled() {
            tracing::debug!(task_id = %id, "Shutdown in progress; leaving task pending");
            return RunOutcome::Deferred;
        }
        match self.store.claim(id).await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.record_claim_skipped();
                tracing::debug!(task_id = %id, "Task already claimed or not pending; skipping");
                return RunOutcome::Skipped;
            }
            Err(error) => {
                tracing::error!(task_id = %id, error = %error, "Failed to claim task");
                return RunOutcome::ClaimFailed(error.to_string());
            }
        }

        let started = Instant::now();
        tracing::info!(task_id = %id, "Task claimed");

        let processed = tokio::select! {
            outcome = AssertUnwindSafe(self.process(id)).catch_unwind() => {
                outcome.unwrap_or_else(|panic| {
                    Err(TaskError::Internal(panic_message(panic.as_ref())))
                })
            }
            _ = self.shutdown.cancelled() => Err(TaskError::Cancelled),
        };

        let outcome = self.finish(id, processed).await;
        tracing::info!(
            task_id = %id,
            elapsed_ms = millis(started.elapsed()),
            outcome = ?outcome,
            "Task finished"
        );
        outcome
    }

    async fn process(&self, id: TaskId) -> Result<ResumeSummary, TaskError> {
        let record = self
            .store
            .get(id)
            .await
            .map_err(|error| TaskError::Internal(format!("loading task: {error}")))?
            .ok_or_else(|| TaskError::Internal("task record vanished after claim".into()))?;

        let text = match record.input().ok_or(TaskError::MissingInput)? {
            TaskInput::Text(text) => {
                tracing::debug!(
                    task_id = %id,
                    chars = text.chars().count(),
                    "Using literal text; skipping fetch"
                );
                text
            }
            TaskInput::DocumentRef(document_ref) => self.extract(id, &document_ref).await?,
        };

        let raw = self.structure(id, &text).await?;
        Ok(parse_resume_summary(&raw)?)
    }

    async fn extract(&self, id: TaskId, document_ref: &str) -> Result<String, TaskError> {
        tracing::info!(task_id = %id, document = %document_ref, "Fetching document");
        let document = self.fetcher.fetch(document_ref).await?;
        let extracted = self.selector.extract(&document, &self.shutdown).await?;
        drop(document);
        self.metrics
            .record_extraction(extracted.engine, extracted.fell_back);
        Ok(extracted.text)
    }

    /// One structuring call under its timeout; every attempt lands in the call audit.
    async fn structure(&self, id: TaskId, text: &str) -> Result<String, TaskError> {
        let started = Instant::now();
        let request = self.structurer.structure(text);
        let result = match tokio::time::timeout(self.structuring_timeout, request).await {
            Ok(Ok(raw)) if raw.trim().is_empty() => Err(StructuringError::EmptyOutput.into()),
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(error)) => Err(TaskError::from(error)),
            Err(_) => Err(TaskError::DownstreamTimeout(millis(self.structuring_timeout))),
        };

        let call = LlmCall {
            task_id: id,
            phase: STRUCTURING_PHASE.to_string(),
            model: self.structurer.model().to_string(),
            latency_ms: millis(started.elapsed()),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(error) = self.store.record_llm_call(call).await {
            tracing::warn!(task_id = %id, error = %error, "Failed to record structuring call");
        }
        result
    }

    async fn finish(&self, id: TaskId, processed: Result<ResumeSummary, TaskError>) -> RunOutcome {
        let message = match processed {
            Ok(summary) => match self.store.complete(id, &summary).await {
                Ok(true) => {
                    self.metrics.record_completed();
                    return RunOutcome::Completed;
                }
                Ok(false) => {
                    tracing::warn!(task_id = %id, "Task was already terminal; result discarded");
                    return RunOutcome::AlreadyTerminal;
                }
                Err(error) => format!("internal error: storing result: {error}"),
            },
            Err(error) => error.to_string(),
        };

        tracing::warn!(task_id = %id, error = %message, "Task failed");
        match self.store.fail(id, &message).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(task_id = %id, "Task was already terminal; failure not recorded");
                return RunOutcome::AlreadyTerminal;
            }
            Err(error) => {
                tracing::error!(task_id = %id, error = %error, "Failed to record task failure");
            }
        }
        self.metrics.record_failed();
        RunOutcome::Failed(message)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("task run panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnginePreference;
    use crate::extraction::{EngineKind, TextExtractor};
    use crate::storage::{DocumentRef, ObjectStore, test_settings};
    use crate::tasks::{InMemoryTaskStore, PhaseCount, StoreError, TaskRecord, TaskStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticStore {
        payload: &'static [u8],
    }

    #[async_trait]
    impl ObjectStore for StaticStore {
        async fn resolve(&self, location: &DocumentRef) -> Result<String, FetchError> {
            Ok(format!("/object/sign/{location}"))
        }

        async fn transfer(&self, _handle: &str, _limit: usize) -> Result<Bytes, FetchError> {
            Ok(Bytes::from_static(self.payload))
        }
    }

    struct StubEngine {
        kind: EngineKind,
        available: bool,
        output: Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl TextExtractor for StubEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        async fn check_available(&self) -> Result<(), String> {
            if self.available {
                Ok(())
            } else {
                Err("missing".into())
            }
        }

        async fn extract(
            &self,
            _document: &Bytes,
            _cancel: &CancellationToken,
        ) -> Result<String, ExtractionError> {
            self.output
                .map(str::to_string)
                .map_err(|message| ExtractionError::engine(self.kind, message))
        }
    }

    enum Reply {
        Json(&'static str),
        Hang,
        Panic,
    }

    struct StubStructurer {
        reply: Reply,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StructuringClient for StubStructurer {
        fn model(&self) -> &str {
            "stub-model"
        }

        async fn structure(&self, _text: &str) -> Result<String, StructuringError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Reply::Json(json) => Ok(json.to_string()),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(String::new())
                }
                Reply::Panic => panic!("structurer blew up"),
            }
        }
    }

    const SUMMARY_JSON: &str =
        r#"{"summary":"Backend engineer","highlights":["Led migration"],"skills":["Rust"],"projects":[]}"#;

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        orchestrator: Arc<TaskOrchestrator>,
        structurer: Arc<StubStructurer>,
        metrics: Arc<TaskMetrics>,
    }

    fn harness(
        in_process: StubEngine,
        external: StubEngine,
        reply: Reply,
        structuring_timeout: Duration,
    ) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let structurer = Arc::new(StubStructurer {
            reply,
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(TaskMetrics::new());
        let fetcher = BinaryFetcher::new(
            Arc::new(StaticStore {
                payload: b"%PDF-1.4 ",
            }),
            test_settings("http://unused".into()),
        );
        let selector = EngineSelector::new(
            EnginePreference::InProcess,
            Arc::new(in_process),
            Arc::new(external),
        );
        let orchestrator = Arc::new(TaskOrchestrator::new(
            store.clone(),
            fetcher,
            selector,
            structurer.clone(),
            structuring_timeout,
            metrics.clone(),
        ));
        Harness {
            store,
            orchestrator,
            structurer,
            metrics,
        }
    }

    fn engine(
        kind: EngineKind,
        available: bool,
        output: Result<&'static str, &'static str>,
    ) -> StubEngine {
        StubEngine {
            kind,
            available,
            output,
        }
    }

    fn working_engines() -> (StubEngine, StubEngine) {
        (
            engine(EngineKind::InProcess, true, Ok("Jane Doe\nRust")),
            engine(EngineKind::External, true, Ok("Jane Doe\nRust")),
        )
    }

    #[tokio::test]
    async fn literal_text_skips_fetch_and_completes() {
        let (in_process, external) = (
            engine(EngineKind::InProcess, true, Err("must not run")),
            engine(EngineKind::External, true, Err("must not run")),
        );
        let h = harness(
            in_process,
            external,
            Reply::Json(SUMMARY_JSON),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::Text("already extracted plain text".into()))
            .await
            .expect("create");

        assert_eq!(h.orchestrator.run(record.id).await, RunOutcome::Completed);

        let stored = h.store.get(record.id).await.expect("get").expect("record");
        assert_eq!(stored.status, TaskStatus::Done);
        assert_eq!(stored.result.expect("result").summary, "Backend engineer");
        assert_eq!(stored.error, None);
        assert_eq!(h.metrics.snapshot().in_process_extractions, 0);
        assert_eq!(
            h.store.llm_calls_by_phase().await.expect("calls"),
            vec![PhaseCount {
                phase: STRUCTURING_PHASE.into(),
                calls: 1,
                failures: 0,
            }]
        );
    }

    #[tokio::test]
    async fn both_engines_failing_ends_in_error() {
        let h = harness(
            engine(EngineKind::InProcess, true, Err("invalid xref")),
            engine(EngineKind::External, true, Err("Syntax Error")),
            Reply::Json(SUMMARY_JSON),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::DocumentRef("resumes/doc1.pdf".into()))
            .await
            .expect("create");

        let outcome = h.orchestrator.run(record.id).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(ref message) if message.starts_with("extraction failed")
        ));

        let stored = h.store.get(record.id).await.expect("get").expect("record");
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(stored.result, None);
        let message = stored.error.expect("error");
        assert!(message.contains("pdftotext engine failed: Syntax Error"));
        assert_eq!(h.structurer.calls.load(Ordering::SeqCst), 0);
        let calls = h.store.llm_calls_by_phase().await.expect("calls");
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn unavailable_preferred_engine_still_completes() {
        let h = harness(
            engine(EngineKind::InProcess, false, Err("unused")),
            engine(EngineKind::External, true, Ok("Jane Doe")),
            Reply::Json(SUMMARY_JSON),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::DocumentRef("doc1.pdf".into()))
            .await
            .expect("create");

        assert_eq!(h.orchestrator.run(record.id).await, RunOutcome::Completed);
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.external_extractions, 1);
        assert_eq!(snapshot.engine_fallbacks, 0);
    }

    #[tokio::test]
    async fn slow_structuring_times_out_into_error() {
        let (in_process, external) = working_engines();
        let h = harness(
            in_process,
            external,
            Reply::Hang,
            Duration::from_millis(200),
        );
        let record = h
            .store
            .create(TaskInput::Text("resume".into()))
            .await
            .expect("create");

        let started = Instant::now();
        let outcome = h.orchestrator.run(record.id).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            outcome,
            RunOutcome::Failed("structuring failed: timed out after 200 ms".into())
        );
        let calls = h.store.llm_calls_by_phase().await.expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].calls, 1);
        assert_eq!(calls[0].failures, 1);
    }

    #[tokio::test]
    async fn unparseable_output_is_an_error() {
        let (in_process, external) = working_engines();
        let h = harness(
            in_process,
            external,
            Reply::Json("I cannot help with that."),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::Text("resume".into()))
            .await
            .expect("create");

        let outcome = h.orchestrator.run(record.id).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(ref message) if message.starts_with("structuring output rejected")
        ));
    }

    #[tokio::test]
    async fn fenced_output_is_repaired() {
        let (in_process, external) = working_engines();
        let h = harness(
            in_process,
            external,
            Reply::Json("```json\n{\"summary\":\"Data analyst\"}\n```"),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::Text("resume".into()))
            .await
            .expect("create");

        assert_eq!(h.orchestrator.run(record.id).await, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn panicking_collaborator_still_reaches_error() {
        let (in_process, external) = working_engines();
        let h = harness(in_process, external, Reply::Panic, Duration::from_secs(5));
        let record = h
            .store
            .create(TaskInput::Text("resume".into()))
            .await
            .expect("create");

        let outcome = h.orchestrator.run(record.id).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(ref message) if message.contains("structurer blew up")
        ));
        let stored = h.store.get(record.id).await.expect("get").expect("record");
        assert_eq!(stored.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn duplicate_concurrent_runs_process_once() {
        let (in_process, external) = working_engines();
        let h = harness(
            in_process,
            external,
            Reply::Json(SUMMARY_JSON),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::DocumentRef("doc1.pdf".into()))
            .await
            .expect("create");

        let (first, second) = tokio::join!(
            h.orchestrator.run(record.id),
            h.orchestrator.run(record.id)
        );

        let outcomes = [first, second];
        assert!(outcomes.contains(&RunOutcome::Completed));
        assert!(outcomes.contains(&RunOutcome::Skipped));
        assert_eq!(h.structurer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics.snapshot().claims_skipped, 1);
    }

    #[tokio::test]
    async fn missing_input_fails_descriptively() {
        let (in_process, external) = working_engines();
        let h = harness(
            in_process,
            external,
            Reply::Json(SUMMARY_JSON),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::Text("x".into()))
            .await
            .expect("create");
        // Simulate a row written without either input column.
        let blank = crate::tasks::TaskRecord {
            text: None,
            document_ref: None,
            ..record
        };
        let store = Arc::new(InMemoryTaskStore::with_records([blank.clone()]));
        let orchestrator = TaskOrchestrator::new(
            store.clone(),
            BinaryFetcher::new(
                Arc::new(StaticStore { payload: b"" }),
                test_settings("http://unused".into()),
            ),
            EngineSelector::new(
                EnginePreference::InProcess,
                Arc::new(engine(EngineKind::InProcess, true, Ok("x"))),
                Arc::new(engine(EngineKind::External, true, Ok("x"))),
            ),
            h.structurer.clone(),
            Duration::from_secs(5),
            Arc::new(TaskMetrics::new()),
        );

        let outcome = orchestrator.run(blank.id).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed("task has neither resume text nor a document reference".into())
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_run() {
        let (in_process, external) = working_engines();
        let h = harness(in_process, external, Reply::Hang, Duration::from_secs(60));
        let record = h
            .store
            .create(TaskInput::Text("resume".into()))
            .await
            .expect("create");

        let token = h.orchestrator.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let outcome = h.orchestrator.run(record.id).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed("cancelled by service shutdown".into())
        );
    }

    #[tokio::test]
    async fn run_after_shutdown_leaves_task_pending() {
        let (in_process, external) = working_engines();
        let h = harness(
            in_process,
            external,
            Reply::Json(SUMMARY_JSON),
            Duration::from_secs(5),
        );
        let record = h
            .store
            .create(TaskInput::Text("resume".into()))
            .await
            .expect("create");

        h.orchestrator.shutdown_token().cancel();

        assert_eq!(h.orchestrator.run(record.id).await, RunOutcome::Deferred);
        let stored = h.store.get(record.id).await.expect("get").expect("record");
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.error, None);
        assert_eq!(h.structurer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.metrics.snapshot().tasks_failed, 0);
    }

    /// Fails every record right before the orchestrator's own completion write lands.
    struct PreemptedStore {
        inner: InMemoryTaskStore,
    }

    #[async_trait]
    impl TaskStore for PreemptedStore {
        async fn create(&self, input: TaskInput) -> Result<TaskRecord, StoreError> {
            self.inner.create(input).await
        }

        async fn claim(&self, id: TaskId) -> Result<bool, StoreError> {
            self.inner.claim(id).await
        }

        async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn complete(&self, id: TaskId, result: &ResumeSummary) -> Result<bool, StoreError> {
            self.inner.fail(id, "interrupted by service restart").await?;
            self.inner.complete(id, result).await
        }

        async fn fail(&self, id: TaskId, message: &str) -> Result<bool, StoreError> {
            self.inner.fail(id, message).await
        }

        async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>, StoreError> {
            self.inner.ids_with_status(status).await
        }

        async fn record_llm_call(&self, call: LlmCall) -> Result<(), StoreError> {
            self.inner.record_llm_call(call).await
        }

        async fn llm_calls_by_phase(&self) -> Result<Vec<PhaseCount>, StoreError> {
            self.inner.llm_calls_by_phase().await
        }
    }

    #[tokio::test]
    async fn completion_on_terminal_record_is_not_counted() {
        let store = Arc::new(PreemptedStore {
            inner: InMemoryTaskStore::new(),
        });
        let metrics = Arc::new(TaskMetrics::new());
        let orchestrator = TaskOrchestrator::new(
            store.clone(),
            BinaryFetcher::new(
                Arc::new(StaticStore { payload: b"" }),
                test_settings("http://unused".into()),
            ),
            EngineSelector::new(
                EnginePreference::InProcess,
                Arc::new(engine(EngineKind::InProcess, true, Ok("x"))),
                Arc::new(engine(EngineKind::External, true, Ok("x"))),
            ),
            Arc::new(StubStructurer {
                reply: Reply::Json(SUMMARY_JSON),
                calls: AtomicUsize::new(0),
            }),
            Duration::from_secs(5),
            metrics.clone(),
        );
        let record = store
            .create(TaskInput::Text("resume".into()))
            .await
            .expect("create");

        assert_eq!(
            orchestrator.run(record.id).await,
            RunOutcome::AlreadyTerminal
        );
        let stored = store.get(record.id).await.expect("get").expect("record");
        assert_eq!(stored.status, TaskStatus::Error);
        assert_eq!(stored.result, None);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_completed, 0);
        assert_eq!(snapshot.tasks_failed, 0);
    }
}
