use super::error::{StorageError, StorageResult};
use super::guard::locked;
use super::memory::RecordStore;
use crate::lock::types::{LockProvider, LockScope, QueryStorageLock};
use crate::query::types::{QueryKey, TaskId, TaskKey, TaskState, TaskStates, Transition};

use std::sync::Arc;

/// Task-states store. One record per query, keyed by query id.
pub struct TaskStatesCache {
    store: Arc<dyn RecordStore<String, TaskStates>>,
    locks: Arc<dyn LockProvider>,
}

impl TaskStatesCache {
    pub fn new(
        store: Arc<dyn RecordStore<String, TaskStates>>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self { store, locks }
    }

    pub fn get_task_states_lock(&self, query_id: &str) -> Box<dyn QueryStorageLock> {
        self.locks.acquire(query_id, LockScope::TaskStates)
    }

    pub async fn update_task_states(&self, states: &TaskStates) -> StorageResult<()> {
        let lock = self.get_task_states_lock(states.query_id());
        locked(lock.as_ref(), async {
            self.store.put(states.query_id().to_string(), states).await
        })
        .await
    }

    pub async fn get_task_states(&self, query_id: &str) -> StorageResult<Option<TaskStates>> {
        self.store.get(&query_id.to_string()).await
    }

    /// Moves one task to `new_state`.
    ///
    /// Returns `Ok(false)` without touching the record when a `Running` request is
    /// refused by the running-task budget.
    pub async fn update_task_state(
        &self,
        task_key: &TaskKey,
        new_state: TaskState,
    ) -> StorageResult<bool> {
        let query_id = task_key.query_id();
        let lock = self.get_task_states_lock(query_id);
        locked(lock.as_ref(), async {
            let key = query_id.to_string();
            let mut states = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("task states of query {}", query_id)))?;

            match states.transition(task_key.task_id, new_state) {
                Transition::Applied => {
                    self.store.put(key, &states).await?;
                    tracing::debug!("Task {} -> {:?}", task_key, new_state);
                    Ok(true)
                }
                Transition::Rejected => {
                    tracing::debug!(
                        "Task {} not moved from {:?} to {:?}: {} of {} running",
                        task_key,
                        states.get_state(task_key.task_id),
                        new_state,
                        states.running_count(),
                        states.max_running
                    );
                    Ok(false)
                }
                Transition::UnknownTask => Err(StorageError::NotFound(format!("task {}", task_key))),
            }
        })
        .await
    }

    /// Reserves the next task id of an existing query and registers it as `Ready`.
    pub async fn allocate_task(&self, query_key: &QueryKey) -> StorageResult<TaskId> {
        let query_id = query_key.query_id.as_str();
        let lock = self.get_task_states_lock(query_id);
        locked(lock.as_ref(), async {
            let key = query_id.to_string();
            let mut states = self.store.get(&key).await?.ok_or_else(|| {
                StorageError::InconsistentState(format!(
                    "no task states for query {}; cannot create a task",
                    query_key
                ))
            })?;

            let task_id = states.allocate_task();
            self.store.put(key, &states).await?;
            Ok(task_id)
        })
        .await
    }

    pub async fn delete_task_states(&self, query_id: &str) -> StorageResult<bool> {
        let lock = self.get_task_states_lock(query_id);
        locked(lock.as_ref(), async {
            Ok(self.store.remove(&query_id.to_string()).await?.is_some())
        })
        .await
    }

    pub async fn get_all(&self) -> StorageResult<Vec<TaskStates>> {
        Ok(self
            .store
            .scan_all()
            .await?
            .into_iter()
            .map(|(_, states)| states)
            .collect())
    }
}
