//! Task dispatch: a bounded queue feeding a fixed pool of orchestrator workers.

use crate::orchestrator::TaskOrchestrator;
use crate::tasks::{StoreError, TaskId, TaskStatus, TaskStore};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::task::TaskTracker;

/// Error recorded on tasks a previous process left in `processing`.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

/// Result of startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale `processing` tasks moved to `error`.
    pub failed_stale: usize,
    /// `pending` tasks put back on the queue.
    pub requeued: usize,
}

/// Hands task ids to workers without blocking the submitting request.
pub struct Dispatcher {
    sender: Mutex<Option<mpsc::Sender<TaskId>>>,
    orchestrator: Arc<TaskOrchestrator>,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Spawn `workers` workers draining a queue of `capacity` ids.
    pub fn start(orchestrator: Arc<TaskOrchestrator>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let tracker = TaskTracker::new();

        for worker in 0..workers.max(1) {
            let receiver = receiver.clone();
            let orchestrator = orchestrator.clone();
            tracker.spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(id) = next else {
                        break;
                    };
                    tracing::debug!(worker, task_id = %id, "Worker picked up task");
                    orchestrator.run(id).await;
                }
                tracing::debug!(worker, "Worker exiting");
            });
        }
        tracing::info!(
            workers = workers.max(1),
            capacity = capacity.max(1),
            "Task workers started"
        );

        Self {
            sender: Mutex::new(Some(sender)),
            orchestrator,
            tracker,
        }
    }

    /// Queue `id` for processing; a full or closed queue falls back to a detached run.
    pub fn dispatch(&self, id: TaskId) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let rejected = match sender {
            Some(sender) => match sender.try_send(id) {
                Ok(()) => return,
                Err(TrySendError::Full(id)) => {
                    tracing::warn!(task_id = %id, "Task queue full; running task detached");
                    id
                }
                Err(TrySendError::Closed(id)) => {
                    tracing::warn!(task_id = %id, "Task queue closed; running task detached");
                    id
                }
            },
            None => {
                tracing::warn!(task_id = %id, "Dispatcher shut down; running task detached");
                id
            }
        };

        let orchestrator = self.orchestrator.clone();
        self.tracker.spawn(async move {
            orchestrator.run(rejected).await;
        });
    }

    /// Fail tasks a previous process left `processing` and requeue those still `pending`.
    pub async fn recover(&self, store: &dyn TaskStore) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        for id in store.ids_with_status(TaskStatus::Processing).await? {
            if store.fail(id, INTERRUPTED_MESSAGE).await? {
                report.failed_stale += 1;
            }
        }
        for id in store.ids_with_status(TaskStatus::Pending).await? {
            self.dispatch(id);
            report.requeued += 1;
        }
        tracing::info!(
            failed_stale = report.failed_stale,
            requeued = report.requeued,
            "Task recovery finished"
        );
        Ok(report)
    }

    /// Close the queue and wait for workers to drain it.
    ///
    /// Runs still busy after `grace` are cancelled and recorded as failed. Queued ids
    /// not yet claimed by then stay `pending` for [`Dispatcher::recover`] on the next start.
    pub async fn shutdown(&self, grace: Duration) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.tracker.close();

        let drained = tokio::time::timeout(grace, self.tracker.wait()).await;
        if drained.is_err() {
            tracing::warn!(
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "Workers still busy; cancelling in-flight tasks"
            );
            self.orchestrator.shutdown_token().cancel();
            self.tracker.wait().await;
        }
        tracing::info!("Task workers stopped");
    }
}
