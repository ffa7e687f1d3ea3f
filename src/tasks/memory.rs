use super::{
    LlmCall, PhaseCount, StoreError, TaskId, TaskInput, TaskRecord, TaskStatus, TaskStore,
};
use crate::structuring::ResumeSummary;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Process-local task store; each transition runs under one write lock.
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    llm_calls: RwLock<Vec<LlmCall>>,
}

impl InMemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `records`, bypassing `create`.
    #[cfg(test)]
    pub(crate) fn with_records(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|record| (record.id, record))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    async fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<ResumeSummary>,
        error: Option<String>,
    ) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = status;
                record.result = result;
                record.error = error;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, input: TaskInput) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::new_pending(input);
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn claim(&self, id: TaskId) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if record.status == TaskStatus::Pending => {
                record.status = TaskStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn complete(&self, id: TaskId, result: &ResumeSummary) -> Result<bool, StoreError> {
        Ok(self
            .finish(id, TaskStatus::Done, Some(result.clone()), None)
            .await)
    }

    async fn fail(&self, id: TaskId, message: &str) -> Result<bool, StoreError> {
        Ok(self
            .finish(id, TaskStatus::Error, None, Some(message.to_string()))
            .await)
    }

    async fn ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<&TaskRecord> = records
            .values()
            .filter(|record| record.status == status)
            .collect();
        matching.sort_by_key(|record| record.created_at);
        Ok(matching.into_iter().map(|record| record.id).collect())
    }

    async fn record_llm_call(&self, call: LlmCall) -> Result<(), StoreError> {
        self.llm_calls.write().await.push(call);
        Ok(())
    }

    async fn llm_calls_by_phase(&self) -> Result<Vec<PhaseCount>, StoreError> {
        let mut by_phase: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for call in self.llm_calls.read().await.iter() {
            let entry = by_phase.entry(call.phase.clone()).or_default();
            entry.0 += 1;
            if !call.success {
                entry.1 += 1;
            }
        }
        Ok(by_phase
            .into_iter()
            .map(|(phase, (calls, failures))| PhaseCount {
                phase,
                calls,
                failures,
            })
            .collect())
    }
}
