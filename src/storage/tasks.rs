use super::error::{StorageError, StorageResult};
use super::memory::RecordStore;
use crate::query::types::{QueryCheckpoint, QueryTask, TaskKey};

use std::sync::Arc;

/// Task store. One record per task, keyed by task key and routed by query id.
///
/// Tasks are never shared between workers at the same time (a task is only
/// touched by the worker that claimed it), so this store does not lock.
pub struct TaskCache {
    store: Arc<dyn RecordStore<TaskKey, QueryTask>>,
}

impl TaskCache {
    pub fn new(store: Arc<dyn RecordStore<TaskKey, QueryTask>>) -> Self {
        Self { store }
    }

    pub async fn add_query_task(&self, task: &QueryTask) -> StorageResult<()> {
        self.store.put(task.task_key.clone(), task).await
    }

    /// Replaces the checkpoint of an existing task.
    pub async fn update_query_task(
        &self,
        task_key: &TaskKey,
        checkpoint: QueryCheckpoint,
    ) -> StorageResult<QueryTask> {
        if task_key.query_key != checkpoint.query_key {
            return Err(StorageError::InconsistentKey {
                task_key: task_key.clone(),
                checkpoint_key: checkpoint.query_key,
            });
        }

        let current = self
            .store
            .get(task_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("task {}", task_key)))?;

        let updated = QueryTask {
            task_key: task_key.clone(),
            action: current.action,
            checkpoint,
        };
        // A concurrent delete between the read and the write wins.
        if self.store.put_if_present(task_key, &updated).await?.is_none() {
            return Err(StorageError::NotFound(format!("task {}", task_key)));
        }
        Ok(updated)
    }

    pub async fn get_task(&self, task_key: &TaskKey) -> StorageResult<Option<QueryTask>> {
        self.store.get(task_key).await
    }

    pub async fn delete_task(&self, task_key: &TaskKey) -> StorageResult<bool> {
        Ok(self.store.remove(task_key).await?.is_some())
    }

    pub async fn get_tasks(&self, query_id: &str) -> StorageResult<Vec<QueryTask>> {
        Ok(self
            .store
            .scan_route(query_id)
            .await?
            .into_iter()
            .map(|(_, task)| task)
            .collect())
    }

    /// Removes every task of a query. Returns how many were removed.
    pub async fn delete_tasks(&self, query_id: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for (key, _) in self.store.scan_route(query_id).await? {
            if self.store.remove(&key).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
