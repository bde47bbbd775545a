//! Query storage facade.
//!
//! Ties the status, task-states and task stores together behind the operations
//! the service and the workers use. No operation is transactional across stores:
//! `create_query` writes three records in sequence and `delete_query` cleans up
//! whatever subset of them exists.

use super::error::StorageResult;
use super::memory::MemoryStore;
use super::partitioner::PartitionManager;
use super::states::TaskStatesCache;
use super::status::QueryStatusCache;
use super::tasks::TaskCache;
use crate::config::StorageConfig;
use crate::lock::types::{LockProvider, QueryStorageLock};
use crate::query::types::*;
use crate::queue::manager::QueryQueueManager;

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

pub struct QueryStorageCache {
    status: QueryStatusCache,
    states: TaskStatesCache,
    tasks: TaskCache,
    queue: Arc<dyn QueryQueueManager>,
    locks: Arc<dyn LockProvider>,
}

impl QueryStorageCache {
    pub fn new(
        locks: Arc<dyn LockProvider>,
        queue: Arc<dyn QueryQueueManager>,
        config: &StorageConfig,
    ) -> Arc<Self> {
        let partitioner = PartitionManager::new(config.num_partitions);
        Arc::new(Self {
            status: QueryStatusCache::new(
                Arc::new(MemoryStore::<String, QueryStatus>::new(partitioner.clone())),
                locks.clone(),
            ),
            states: TaskStatesCache::new(
                Arc::new(MemoryStore::<String, TaskStates>::new(partitioner.clone())),
                locks.clone(),
            ),
            tasks: TaskCache::new(Arc::new(MemoryStore::<TaskKey, QueryTask>::new(partitioner))),
            queue,
            locks,
        })
    }

    pub fn queue_manager(&self) -> Arc<dyn QueryQueueManager> {
        self.queue.clone()
    }

    // ============================================================
    // QUERY LIFECYCLE
    // ============================================================

    /// Registers a new query and its initial `Create` task.
    ///
    /// `max_running` is the number of tasks of this query that may run at once.
    pub async fn create_query(
        &self,
        query_pool: &str,
        mut query: Query,
        user_id: &str,
        calculated_auths: BTreeSet<String>,
        max_running: usize,
    ) -> StorageResult<TaskKey> {
        let query_id = Uuid::new_v4().to_string();
        let query_key = QueryKey::new(query_pool, query_id.clone(), query.query_logic_name.clone());
        query.owner = Some(user_id.to_string());

        let now = Utc::now();
        let mut status = QueryStatus::new(query_key.clone());
        status.query_state = QueryState::Created;
        status.calculated_auths = calculated_auths;
        status.query = Some(query.clone());
        status.touch_last_used(now);
        status.touch_last_updated(now);
        self.status.update_query_status(&status).await?;

        let states = TaskStates::new(query_key.clone(), max_running);
        self.states.update_task_states(&states).await?;

        let checkpoint = QueryCheckpoint::new(query_key, serde_json::to_value(&query)?);
        let task = self.create_task(QueryAction::Create, checkpoint).await?;

        tracing::info!(
            "Created query {} for {} in pool {} (max running {})",
            query_id,
            user_id,
            query_pool,
            max_running
        );
        Ok(task.task_key)
    }

    /// Removes every record of a query. Missing records are skipped.
    ///
    /// Returns whether anything was removed.
    pub async fn delete_query(&self, query_id: &str) -> StorageResult<bool> {
        let status_removed = self.status.delete_query_status(query_id).await?;
        let states_removed = self.states.delete_task_states(query_id).await?;
        let tasks_removed = self.tasks.delete_tasks(query_id).await?;

        if let Err(e) = self.queue.delete_queue(query_id).await {
            tracing::warn!("Failed to delete result queue of query {}: {}", query_id, e);
        }
        self.locks.forget_query(query_id);

        tracing::info!(
            "Deleted query {} (status: {}, states: {}, tasks: {})",
            query_id,
            status_removed,
            states_removed,
            tasks_removed
        );
        Ok(status_removed || states_removed || tasks_removed > 0)
    }

    // ============================================================
    // TASKS
    // ============================================================

    /// Adds a `Ready` task to an existing query.
    pub async fn create_task(
        &self,
        action: QueryAction,
        checkpoint: QueryCheckpoint,
    ) -> StorageResult<QueryTask> {
        let task_id = self.states.allocate_task(&checkpoint.query_key).await?;
        let task = QueryTask::new(task_id, action, checkpoint);
        self.tasks.add_query_task(&task).await?;

        tracing::debug!("Created {:?} task {}", action, task.task_key);
        Ok(task)
    }

    pub async fn get_task(&self, task_key: &TaskKey) -> StorageResult<Option<QueryTask>> {
        self.tasks.get_task(task_key).await
    }

    /// Replaces a task's checkpoint. The checkpoint must belong to the task's query.
    pub async fn checkpoint_task(
        &self,
        task_key: &TaskKey,
        checkpoint: QueryCheckpoint,
    ) -> StorageResult<QueryTask> {
        self.tasks.update_query_task(task_key, checkpoint).await
    }

    /// Removes one task. Returns false if it did not exist.
    pub async fn delete_task(&self, task_key: &TaskKey) -> StorageResult<bool> {
        self.tasks.delete_task(task_key).await
    }

    pub async fn get_tasks(&self, query_id: &str) -> StorageResult<Vec<TaskKey>> {
        Ok(self
            .tasks
            .get_tasks(query_id)
            .await?
            .into_iter()
            .map(|task| task.task_key)
            .collect())
    }

    pub async fn get_task_descriptions(&self, query_id: &str) -> StorageResult<Vec<TaskDescription>> {
        let states = self.states.get_task_states(query_id).await?;
        Ok(self
            .tasks
            .get_tasks(query_id)
            .await?
            .iter()
            .map(|task| {
                let state = states
                    .as_ref()
                    .and_then(|s| s.get_state(task.task_key.task_id));
                task.describe(state)
            })
            .collect())
    }

    // ============================================================
    // QUERY STATUS
    // ============================================================

    pub fn get_query_status_lock(&self, query_id: &str) -> Box<dyn QueryStorageLock> {
        self.status.get_query_status_lock(query_id)
    }

    pub async fn update_query_status(&self, status: &QueryStatus) -> StorageResult<()> {
        self.status.update_query_status(status).await
    }

    pub async fn update_query_state(&self, query_id: &str, state: QueryState) -> StorageResult<()> {
        self.update_query_status_with(query_id, |status| status.query_state = state)
            .await?;
        tracing::info!("Query {} -> {:?}", query_id, state);
        Ok(())
    }

    /// Applies `mutate` to the stored status under the status lock.
    pub async fn update_query_status_with<R, F>(&self, query_id: &str, mutate: F) -> StorageResult<R>
    where
        F: FnOnce(&mut QueryStatus) -> R + Send,
        R: Send,
    {
        self.status.update_with(query_id, mutate).await
    }

    pub async fn get_query_status(&self, query_id: &str) -> StorageResult<Option<QueryStatus>> {
        self.status.get_query_status(query_id).await
    }

    pub async fn get_all_query_status(&self) -> StorageResult<Vec<QueryStatus>> {
        self.status.get_all().await
    }

    /// Counts results handed to the user and marks the query as recently used.
    pub async fn record_results_returned(&self, query_id: &str, count: u64) -> StorageResult<()> {
        self.update_query_status_with(query_id, |status| {
            status.increment_num_results_returned(count);
            status.touch_last_used(Utc::now());
        })
        .await
    }

    // ============================================================
    // TASK STATES
    // ============================================================

    pub fn get_task_states_lock(&self, query_id: &str) -> Box<dyn QueryStorageLock> {
        self.states.get_task_states_lock(query_id)
    }

    pub async fn update_task_states(&self, states: &TaskStates) -> StorageResult<()> {
        self.states.update_task_states(states).await
    }

    pub async fn get_task_states(&self, query_id: &str) -> StorageResult<Option<TaskStates>> {
        self.states.get_task_states(query_id).await
    }

    /// Returns false when a `Running` request is refused by the running-task budget.
    pub async fn update_task_state(
        &self,
        task_key: &TaskKey,
        new_state: TaskState,
    ) -> StorageResult<bool> {
        self.states.update_task_state(task_key, new_state).await
    }

    /// Every query that has `Ready` work, with its ready task ids.
    pub async fn ready_tasks(&self) -> StorageResult<Vec<(QueryKey, Vec<TaskId>)>> {
        Ok(self
            .states
            .get_all()
            .await?
            .into_iter()
            .filter(|states| states.has_ready_tasks())
            .map(|states| {
                let ready = states.tasks_in_state(TaskState::Ready);
                (states.query_key, ready)
            })
            .collect())
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        tracing::info!("Query storage shut down");
    }
}
