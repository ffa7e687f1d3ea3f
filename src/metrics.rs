use std::sync::atomic::{AtomicU64, Ordering};

use crate::extraction::EngineKind;

/// Thread-safe counters describing task activity since startup.
#[derive(Default)]
pub struct TaskMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    claims_skipped: AtomicU64,
    fallbacks: AtomicU64,
    in_process_extractions: AtomicU64,
    external_extractions: AtomicU64,
}

impl TaskMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted submission.
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run that ended in `done`.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run that ended in `error`.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run that found its task already claimed.
    pub fn record_claim_skipped(&self) {
        self.claims_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful extraction and whether it needed the fallback engine.
    pub fn record_extraction(&self, engine: EngineKind, fell_back: bool) {
        let counter = match engine {
            EngineKind::InProcess => &self.in_process_extractions,
            EngineKind::External => &self.external_extractions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if fell_back {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.submitted.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            claims_skipped: self.claims_skipped.load(Ordering::Relaxed),
            engine_fallbacks: self.fallbacks.load(Ordering::Relaxed),
            in_process_extractions: self.in_process_extractions.load(Ordering::Relaxed),
            external_extractions: self.external_extractions.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of task counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Tasks accepted by the submission entrypoint.
    pub tasks_submitted: u64,
    /// Tasks that reached `done`.
    pub tasks_completed: u64,
    /// Tasks that reached `error`.
    pub tasks_failed: u64,
    /// Orchestrator runs that lost the claim race and exited early.
    pub claims_skipped: u64,
    /// Extractions that succeeded only on the alternate engine.
    pub engine_fallbacks: u64,
    /// Successful extractions by the in-process engine.
    pub in_process_extractions: u64,
    /// Successful extractions by the external-process engine.
    pub external_extractions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_terminal_outcomes() {
        let metrics = TaskMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_completed();
        metrics.record_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted, 2);
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
    }

    #[test]
    fn extraction_counts_split_by_engine() {
        let metrics = TaskMetrics::new();
        metrics.record_extraction(EngineKind::InProcess, false);
        metrics.record_extraction(EngineKind::External, true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_process_extractions, 1);
        assert_eq!(snapshot.external_extractions, 1);
        assert_eq!(snapshot.engine_fallbacks, 1);
    }
}
