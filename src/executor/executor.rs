//! Worker Pool Implementation
//!
//! Spawns workers that scan the task-states store for `Ready` tasks of open
//! queries and execute them through the `QueryLogicRegistry`.
//!
//! ## Responsibilities
//! - **Claiming**: moving a task to `Running` through the budgeted transition. A
//!   refusal means the query is at its running-task budget; the worker moves on.
//! - **Execution**: invoking the query logic, publishing its results and updating
//!   the query status.
//! - **Chaining**: creating the follow-up task a logic asks for, then retiring the
//!   finished one.

use super::registry::{QueryLogicRegistry, TaskOutcome};
use crate::config::ExecutorConfig;
use crate::query::types::*;
use crate::storage::cache::QueryStorageCache;
use crate::storage::error::StorageResult;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TaskExecutor {
    storage: Arc<QueryStorageCache>,
    logic: Arc<QueryLogicRegistry>,
    worker_count: usize,
    poll_interval: Duration,
}

impl TaskExecutor {
    pub fn new(
        storage: Arc<QueryStorageCache>,
        logic: Arc<QueryLogicRegistry>,
        config: &ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            logic,
            worker_count: config.worker_count.max(1),
            poll_interval: config.poll_interval,
        })
    }

    /// Spawns the workers and returns their handles. Workers exit once `shutdown`
    /// fires and their current task is finished.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting {} task workers", self.worker_count);

        (0..self.worker_count)
            .map(|worker_id| {
                let executor = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    executor.worker_loop(worker_id, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        tracing::info!("Worker {} started", worker_id);

        while !shutdown.is_cancelled() {
            let worked = match self.run_once(worker_id).await {
                Ok(worked) => worked,
                Err(e) => {
                    tracing::warn!("Worker {} scan failed: {}", worker_id, e);
                    false
                }
            };

            if !worked {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        tracing::info!("Worker {} stopped", worker_id);
    }

    /// Claims and executes at most one task. Returns whether a task ran.
    pub async fn run_once(&self, worker_id: usize) -> StorageResult<bool> {
        for (query_key, ready) in self.storage.ready_tasks().await? {
            let open = self
                .storage
                .get_query_status(&query_key.query_id)
                .await?
                .map(|status| status.query_state == QueryState::Created)
                .unwrap_or(false);
            if !open {
                continue;
            }

            for task_id in ready {
                let task_key = TaskKey::new(task_id, query_key.clone());
                match self.storage.update_task_state(&task_key, TaskState::Running).await {
                    Ok(true) => {
                        tracing::debug!("Worker {} claimed task {}", worker_id, task_key);
                        self.execute_claimed(worker_id, task_key).await;
                        return Ok(true);
                    }
                    Ok(false) => {
                        tracing::trace!("Task {} not claimable right now", task_key);
                    }
                    Err(e) if e.is_not_found() || e.is_retryable() => {
                        tracing::debug!("Skipping task {}: {}", task_key, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(false)
    }

    async fn execute_claimed(&self, worker_id: usize, task_key: TaskKey) {
        let task = match self.storage.get_task(&task_key).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!("Claimed task {} has no record; dropping it", task_key);
                self.mark(&task_key, TaskState::Failed).await;
                return;
            }
            Err(e) => {
                tracing::error!("Failed to load claimed task {}: {}", task_key, e);
                self.mark(&task_key, TaskState::Failed).await;
                return;
            }
        };

        if task.action == QueryAction::Next
            && let Err(e) = self
                .storage
                .update_query_status_with(task_key.query_id(), |status| {
                    status.concurrent_next_count += 1;
                })
                .await
        {
            tracing::warn!("Failed to count next call of {}: {}", task_key, e);
        }

        let outcome = self.logic.execute(&task).await;
        let finished = match outcome {
            Ok(outcome) => self.complete(&task, outcome).await,
            Err(e) => Err(e),
        };

        match finished {
            Ok(()) => {
                tracing::debug!("Worker {} completed task {}", worker_id, task_key);
            }
            Err(e) => {
                tracing::error!("Worker {} failed task {}: {:#}", worker_id, task_key, e);
                self.fail(&task, &e).await;
            }
        }
    }

    async fn complete(&self, task: &QueryTask, outcome: TaskOutcome) -> Result<()> {
        let task_key = &task.task_key;
        let query_id = task_key.query_id();
        let queue = self.storage.queue_manager();

        for result in &outcome.results {
            queue.send_message(query_id, result).await?;
        }

        let generated = outcome.results.len() as u64;
        let action = task.action;
        let plan = outcome.plan.clone();
        let terminal = self
            .storage
            .update_query_status_with(query_id, move |status| {
                status.increment_num_results_generated(generated);
                if action == QueryAction::Next {
                    status.concurrent_next_count = status.concurrent_next_count.saturating_sub(1);
                    if generated > 0 {
                        status.last_page_number += 1;
                    }
                }
                if plan.is_some() {
                    status.plan = plan;
                }
                if action == QueryAction::Close && !status.query_state.is_terminal() {
                    status.query_state = QueryState::Closed;
                }
                status.query_state.is_terminal()
            })
            .await?;

        if let Some((next_action, config)) = outcome.next {
            if terminal {
                tracing::debug!(
                    "Query {} is finished; not scheduling {:?}",
                    query_id,
                    next_action
                );
            } else {
                let checkpoint = QueryCheckpoint::new(task_key.query_key.clone(), config);
                self.storage.create_task(next_action, checkpoint).await?;
            }
        }

        self.storage.delete_task(task_key).await?;
        self.storage
            .update_task_state(task_key, TaskState::Completed)
            .await?;
        Ok(())
    }

    async fn fail(&self, task: &QueryTask, error: &anyhow::Error) {
        self.mark(&task.task_key, TaskState::Failed).await;

        let action = task.action;
        let recorded = self
            .storage
            .update_query_status_with(task.task_key.query_id(), |status| {
                if action == QueryAction::Next {
                    status.concurrent_next_count = status.concurrent_next_count.saturating_sub(1);
                }
                status.set_failure(error);
                if !status.query_state.is_terminal() {
                    status.query_state = QueryState::Failed;
                }
            })
            .await;

        if let Err(e) = recorded {
            tracing::error!(
                "Failed to record failure of query {}: {}",
                task.task_key.query_id(),
                e
            );
        }
    }

    async fn mark(&self, task_key: &TaskKey, state: TaskState) {
        if let Err(e) = self.storage.update_task_state(task_key, state).await {
            tracing::warn!("Failed to mark task {} {:?}: {}", task_key, state, e);
        }
    }
}
