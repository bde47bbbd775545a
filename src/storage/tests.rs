//! Storage Module Tests
//!
//! Validates shard routing, the record backend and the facade operations.
//!
//! ## Test Scopes
//! - **Partitioner**: Deterministic hashing and fair distribution of query ids.
//! - **MemoryStore**: Put/get/scan mechanics and copy-on-read semantics.
//! - **QueryStorageCache**: Query lifecycle, task checkpoints, the running-task
//!   budget and cleanup of partial state.

#[cfg(test)]
mod tests {
    use crate::config::{QueueConfig, StorageConfig};
    use crate::lock::local::LocalLockProvider;
    use crate::lock::types::LockScope;
    use crate::query::types::*;
    use crate::queue::local::LocalQueueManager;
    use crate::storage::cache::QueryStorageCache;
    use crate::storage::error::StorageError;
    use crate::storage::memory::{MemoryStore, RecordStore};
    use crate::storage::partitioner::PartitionManager;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn storage() -> Arc<QueryStorageCache> {
        let locks = LocalLockProvider::new(Duration::from_millis(200));
        let queue = LocalQueueManager::new(&QueueConfig {
            capacity: 16,
            receive_timeout: Duration::from_millis(100),
            send_timeout: Duration::from_millis(100),
        });
        QueryStorageCache::new(locks, queue, &StorageConfig::default())
    }

    fn auths() -> BTreeSet<String> {
        ["PUBLIC", "PRIVATE"].iter().map(|a| a.to_string()).collect()
    }

    fn query() -> Query {
        Query::new("FIELD:value", "EventQuery").with_parameter("query.syntax", "LUCENE")
    }

    async fn create(storage: &QueryStorageCache, max_running: usize) -> TaskKey {
        storage
            .create_query("default", query(), "alice", auths(), max_running)
            .await
            .unwrap()
    }

    // ============================================================
    // PARTITIONER TESTS
    // ============================================================

    #[test]
    fn test_partition_is_deterministic() {
        let partitioner = PartitionManager::new(256);

        let p1 = partitioner.get_partition("query_100");
        let p2 = partitioner.get_partition("query_100");
        assert_eq!(p1, p2, "The same value should yield the same partition");
    }

    #[test]
    fn test_partition_distribution() {
        let partitioner = PartitionManager::new(256);

        let mut partition_counts = std::collections::HashMap::new();
        for _ in 0..10000 {
            let partition = partitioner.get_partition(&Uuid::new_v4().to_string());
            assert!(partition < partitioner.num_partitions);
            *partition_counts.entry(partition).or_insert(0) += 1;
        }

        assert!(
            partition_counts.len() > 100,
            "Should have more than 100 distinct partitions used, got: {}",
            partition_counts.len()
        );
    }

    // ============================================================
    // MEMORY STORE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_memory_store_put_get_overwrite() {
        let store: MemoryStore<String, QueryStatus> = MemoryStore::new(PartitionManager::new(8));
        let key = QueryKey::new("default", "q-1", "EventQuery");

        assert!(store.get(&"q-1".to_string()).await.unwrap().is_none());

        let mut status = QueryStatus::new(key);
        store.put("q-1".to_string(), &status).await.unwrap();
        status.query_state = QueryState::Closed;
        store.put("q-1".to_string(), &status).await.unwrap();

        let stored = store.get(&"q-1".to_string()).await.unwrap().unwrap();
        assert_eq!(stored.query_state, QueryState::Closed);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_reads_are_copies() {
        let store: MemoryStore<String, QueryStatus> = MemoryStore::new(PartitionManager::new(8));
        let status = QueryStatus::new(QueryKey::new("default", "q-1", "EventQuery"));
        store.put("q-1".to_string(), &status).await.unwrap();

        let mut copy = store.get(&"q-1".to_string()).await.unwrap().unwrap();
        copy.increment_num_results_generated(10);

        let stored = store.get(&"q-1".to_string()).await.unwrap().unwrap();
        assert_eq!(stored.num_results_generated, 0);
    }

    #[tokio::test]
    async fn test_memory_store_put_if_present() {
        let store: MemoryStore<String, QueryStatus> = MemoryStore::new(PartitionManager::new(8));
        let status = QueryStatus::new(QueryKey::new("default", "q-1", "EventQuery"));

        let replaced = store.put_if_present(&"q-1".to_string(), &status).await.unwrap();
        assert!(replaced.is_none());
        assert!(store.is_empty());

        store.put("q-1".to_string(), &status).await.unwrap();
        let replaced = store.put_if_present(&"q-1".to_string(), &status).await.unwrap();
        assert_eq!(replaced, Some(status));
    }

    #[tokio::test]
    async fn test_memory_store_scan_route_isolates_queries() {
        let store: MemoryStore<TaskKey, QueryTask> = MemoryStore::new(PartitionManager::new(1));
        let a = QueryKey::new("default", "q-a", "EventQuery");
        let b = QueryKey::new("default", "q-b", "EventQuery");

        for (id, key) in [(0, &a), (1, &a), (0, &b)] {
            let task = QueryTask::new(
                id,
                QueryAction::Next,
                QueryCheckpoint::new(key.clone(), json!({})),
            );
            store.put(task.task_key.clone(), &task).await.unwrap();
        }

        assert_eq!(store.scan_route("q-a").await.unwrap().len(), 2);
        assert_eq!(store.scan_route("q-b").await.unwrap().len(), 1);
        assert_eq!(store.scan_all().await.unwrap().len(), 3);
    }

    // ============================================================
    // LOCK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_status_and_task_states_locks_are_independent() {
        let storage = storage();
        let query_id = Uuid::new_v4().to_string();
        let status_lock = storage.get_query_status_lock(&query_id);
        let states_lock = storage.get_task_states_lock(&query_id);

        assert_eq!(status_lock.scope(), LockScope::QueryStatus);
        assert!(!status_lock.is_locked().await.unwrap());
        assert!(!states_lock.is_locked().await.unwrap());

        status_lock.lock().await.unwrap();
        assert!(status_lock.is_locked().await.unwrap());
        assert!(!states_lock.is_locked().await.unwrap());

        states_lock.lock().await.unwrap();
        assert!(states_lock.is_locked().await.unwrap());

        status_lock.unlock().await.unwrap();
        assert!(!status_lock.is_locked().await.unwrap());
        assert!(states_lock.is_locked().await.unwrap());

        states_lock.unlock().await.unwrap();
        assert!(!states_lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_held_status_lock_blocks_status_update_only() {
        let storage = storage();
        let task_key = create(&storage, 2).await;
        let query_id = task_key.query_id().to_string();

        let held = storage.get_query_status_lock(&query_id);
        held.lock().await.unwrap();

        let err = storage
            .update_query_state(&query_id, QueryState::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Lock(_)));
        assert!(err.is_retryable());

        // Task states are a separate resource.
        assert!(storage.update_task_state(&task_key, TaskState::Running).await.unwrap());

        held.unlock().await.unwrap();
        storage
            .update_query_state(&query_id, QueryState::Closed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_released_after_failed_operation() {
        let storage = storage();
        let task_key = create(&storage, 2).await;
        let missing = TaskKey::new(99, task_key.query_key.clone());

        let err = storage
            .update_task_state(&missing, TaskState::Running)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let lock = storage.get_task_states_lock(task_key.query_id());
        assert!(!lock.is_locked().await.unwrap());
    }

    // ============================================================
    // QUERY LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_create_query() {
        let storage = storage();

        let task_key = create(&storage, 3).await;
        let query_id = task_key.query_id();

        // One Create task, ready.
        let tasks = storage.get_tasks(query_id).await.unwrap();
        assert_eq!(tasks, vec![task_key.clone()]);
        let task = storage.get_task(&task_key).await.unwrap().unwrap();
        assert_eq!(task.action, QueryAction::Create);
        assert_eq!(task.checkpoint.query_key, task_key.query_key);
        assert_eq!(task.checkpoint.config["query"], "FIELD:value");

        // Status is created and owned.
        let status = storage.get_query_status(query_id).await.unwrap().unwrap();
        assert_eq!(status.query_state, QueryState::Created);
        assert_eq!(status.query_key, task_key.query_key);
        assert_eq!(status.calculated_auths, auths());
        assert_eq!(
            status.query.as_ref().and_then(|q| q.owner.as_deref()),
            Some("alice")
        );
        assert!(status.last_used.is_some());

        // Task states sized to the budget.
        let states = storage.get_task_states(query_id).await.unwrap().unwrap();
        assert_eq!(states.max_running, 3);
        assert_eq!(states.get_state(task_key.task_id), Some(TaskState::Ready));
        assert_eq!(states.states().len(), 1);
    }

    #[tokio::test]
    async fn test_update_query_state() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let query_id = task_key.query_id();

        storage
            .update_query_state(query_id, QueryState::Canceled)
            .await
            .unwrap();

        let status = storage.get_query_status(query_id).await.unwrap().unwrap();
        assert_eq!(status.query_state, QueryState::Canceled);
    }

    #[tokio::test]
    async fn test_update_unknown_query_status_is_not_found() {
        let storage = storage();

        let err = storage
            .update_query_state("nope", QueryState::Closed)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_update_query_status_with_returns_closure_value() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let query_id = task_key.query_id();
        let before = storage.get_query_status(query_id).await.unwrap().unwrap();

        let generated = storage
            .update_query_status_with(query_id, |status| {
                status.increment_num_results_generated(4);
                status.num_results_generated
            })
            .await
            .unwrap();

        assert_eq!(generated, 4);
        let after = storage.get_query_status(query_id).await.unwrap().unwrap();
        assert!(after.last_updated >= before.last_updated);
    }

    #[tokio::test]
    async fn test_record_results_returned() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let query_id = task_key.query_id();

        storage.record_results_returned(query_id, 3).await.unwrap();
        storage.record_results_returned(query_id, 2).await.unwrap();

        let status = storage.get_query_status(query_id).await.unwrap().unwrap();
        assert_eq!(status.num_results_returned, 5);
    }

    #[tokio::test]
    async fn test_get_all_query_status() {
        let storage = storage();
        let a = create(&storage, 1).await;
        let b = create(&storage, 1).await;

        let mut ids: Vec<String> = storage
            .get_all_query_status()
            .await
            .unwrap()
            .iter()
            .map(|s| s.query_id().to_string())
            .collect();
        ids.sort();

        let mut expected = vec![a.query_id().to_string(), b.query_id().to_string()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_delete_query_removes_everything() {
        let storage = storage();
        let task_key = create(&storage, 10).await;
        let query_id = task_key.query_id().to_string();
        let checkpoint = QueryCheckpoint::new(task_key.query_key.clone(), json!({"page": 1}));
        for _ in 0..4 {
            storage
                .create_task(QueryAction::Next, checkpoint.clone())
                .await
                .unwrap();
        }
        let listed = storage.get_tasks(&query_id).await.unwrap();
        assert_eq!(listed.len(), 5);

        assert!(storage.delete_query(&query_id).await.unwrap());

        for key in &listed {
            assert!(storage.get_task(key).await.unwrap().is_none());
        }
        assert!(storage.get_tasks(&query_id).await.unwrap().is_empty());
        assert!(storage.get_task_states(&query_id).await.unwrap().is_none());
        assert!(
            storage
                .get_all_query_status()
                .await
                .unwrap()
                .iter()
                .all(|s| s.query_id() != query_id)
        );
    }

    #[tokio::test]
    async fn test_delete_query_tolerates_partial_state() {
        let storage = storage();
        let key = QueryKey::new("default", Uuid::new_v4().to_string(), "EventQuery");

        // Status written, crash before task states or tasks.
        let mut status = QueryStatus::new(key.clone());
        status.query_state = QueryState::Created;
        storage.update_query_status(&status).await.unwrap();

        assert!(storage.delete_query(&key.query_id).await.unwrap());
        assert!(storage.get_query_status(&key.query_id).await.unwrap().is_none());

        // Second delete finds nothing and still succeeds.
        assert!(!storage.delete_query(&key.query_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_query_disconnects_listeners() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let query_id = task_key.query_id();
        let queues = storage.queue_manager();
        let _listener = queues.create_listener("l-1", query_id).await.unwrap();
        assert_eq!(queues.listener_count(query_id), 1);

        storage.delete_query(query_id).await.unwrap();

        assert_eq!(queues.listener_count(query_id), 0);
    }

    // ============================================================
    // TASK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_create_task() {
        let storage = storage();
        let task_key = create(&storage, 10).await;
        let checkpoint = QueryCheckpoint::new(task_key.query_key.clone(), json!({"shard": 7}));

        let task = storage
            .create_task(QueryAction::Next, checkpoint.clone())
            .await
            .unwrap();

        assert_eq!(task.task_key.query_key, task_key.query_key);
        assert_ne!(task.task_key.task_id, task_key.task_id);
        assert_eq!(task.checkpoint, checkpoint);

        let stored = storage.get_task(&task.task_key).await.unwrap().unwrap();
        assert_eq!(stored, task);

        let states = storage
            .get_task_states(task_key.query_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(states.get_state(task.task_key.task_id), Some(TaskState::Ready));
    }

    #[tokio::test]
    async fn test_create_task_ignores_budget() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let checkpoint = QueryCheckpoint::new(task_key.query_key.clone(), json!({}));

        for _ in 0..5 {
            storage
                .create_task(QueryAction::Next, checkpoint.clone())
                .await
                .unwrap();
        }

        assert_eq!(storage.get_tasks(task_key.query_id()).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_create_task_without_task_states_is_inconsistent() {
        let storage = storage();
        let key = QueryKey::new("default", Uuid::new_v4().to_string(), "EventQuery");

        let err = storage
            .create_task(QueryAction::Next, QueryCheckpoint::new(key.clone(), json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InconsistentState(_)));
        assert!(storage.get_tasks(&key.query_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let first = QueryCheckpoint::new(task_key.query_key.clone(), json!({"page": 1}));
        let second = QueryCheckpoint::new(task_key.query_key.clone(), json!({"page": 2}));

        storage.checkpoint_task(&task_key, first).await.unwrap();
        let updated = storage.checkpoint_task(&task_key, second.clone()).await.unwrap();

        assert_eq!(updated.action, QueryAction::Create);
        let stored = storage.get_task(&task_key).await.unwrap().unwrap();
        assert_eq!(stored.checkpoint, second);
    }

    #[tokio::test]
    async fn test_checkpoint_with_mismatched_key_is_inconsistent() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let other = QueryKey::new("default", Uuid::new_v4().to_string(), "EventQuery");

        let err = storage
            .checkpoint_task(&task_key, QueryCheckpoint::new(other, json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InconsistentKey { .. }));
    }

    #[tokio::test]
    async fn test_checkpoint_missing_task_is_not_found() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let missing = TaskKey::new(42, task_key.query_key.clone());

        let err = storage
            .checkpoint_task(&missing, QueryCheckpoint::new(task_key.query_key.clone(), json!({})))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(storage.get_task(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_checks_keys_before_existence() {
        let storage = storage();
        let a = QueryKey::new("default", "q-a", "EventQuery");
        let b = QueryKey::new("default", "q-b", "EventQuery");

        let err = storage
            .checkpoint_task(&TaskKey::new(0, a), QueryCheckpoint::new(b, json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InconsistentKey { .. }));
    }

    #[tokio::test]
    async fn test_get_and_delete_task() {
        let storage = storage();
        let task_key = create(&storage, 1).await;

        assert!(storage.get_task(&task_key).await.unwrap().is_some());
        assert!(storage.delete_task(&task_key).await.unwrap());
        assert!(storage.get_task(&task_key).await.unwrap().is_none());

        // Deleting again is a no-op.
        assert!(!storage.delete_task(&task_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_task_descriptions_join_states() {
        let storage = storage();
        let task_key = create(&storage, 2).await;
        let next = storage
            .create_task(
                QueryAction::Next,
                QueryCheckpoint::new(task_key.query_key.clone(), json!({})),
            )
            .await
            .unwrap();
        storage
            .update_task_state(&task_key, TaskState::Running)
            .await
            .unwrap();

        let mut descriptions = storage
            .get_task_descriptions(task_key.query_id())
            .await
            .unwrap();
        descriptions.sort_by_key(|d| d.task_key.task_id);

        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[0].action, QueryAction::Create);
        assert_eq!(descriptions[0].state, Some(TaskState::Running));
        assert_eq!(descriptions[1].task_key, next.task_key);
        assert_eq!(descriptions[1].state, Some(TaskState::Ready));
    }

    // ============================================================
    // TASK STATE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_task_state_budget() {
        let storage = storage();
        let task_key = create(&storage, 2).await;
        let checkpoint = QueryCheckpoint::new(task_key.query_key.clone(), json!({}));
        let second = storage
            .create_task(QueryAction::Next, checkpoint.clone())
            .await
            .unwrap()
            .task_key;
        let third = storage
            .create_task(QueryAction::Next, checkpoint)
            .await
            .unwrap()
            .task_key;

        assert!(storage.update_task_state(&task_key, TaskState::Running).await.unwrap());
        assert!(storage.update_task_state(&second, TaskState::Running).await.unwrap());

        // Budget exhausted: refused, nothing changes.
        let before = storage.get_task_states(task_key.query_id()).await.unwrap();
        assert!(!storage.update_task_state(&third, TaskState::Running).await.unwrap());
        let after = storage.get_task_states(task_key.query_id()).await.unwrap();
        assert_eq!(before, after);

        // Completing one frees a slot.
        assert!(storage.update_task_state(&task_key, TaskState::Completed).await.unwrap());
        assert!(storage.update_task_state(&third, TaskState::Running).await.unwrap());

        // Failing always succeeds.
        assert!(storage.update_task_state(&second, TaskState::Failed).await.unwrap());
    }

    #[tokio::test]
    async fn test_finished_task_cannot_be_claimed_again() {
        let storage = storage();
        let task_key = create(&storage, 3).await;
        let checkpoint = QueryCheckpoint::new(task_key.query_key.clone(), json!({}));
        let failed = storage
            .create_task(QueryAction::Next, checkpoint)
            .await
            .unwrap()
            .task_key;

        assert!(storage.update_task_state(&task_key, TaskState::Running).await.unwrap());
        assert!(storage.update_task_state(&task_key, TaskState::Completed).await.unwrap());
        assert!(storage.update_task_state(&failed, TaskState::Running).await.unwrap());
        assert!(storage.update_task_state(&failed, TaskState::Failed).await.unwrap());

        // ACT: a stale claim and a reset on each finished task
        let before = storage.get_task_states(task_key.query_id()).await.unwrap();
        for key in [&task_key, &failed] {
            assert!(!storage.update_task_state(key, TaskState::Running).await.unwrap());
            assert!(!storage.update_task_state(key, TaskState::Ready).await.unwrap());
        }

        // ASSERT: nothing moved and no slot is taken
        let after = storage.get_task_states(task_key.query_id()).await.unwrap();
        assert_eq!(before, after);
        let states = after.unwrap();
        assert_eq!(states.get_state(task_key.task_id), Some(TaskState::Completed));
        assert_eq!(states.get_state(failed.task_id), Some(TaskState::Failed));
        assert_eq!(states.running_count(), 0);
        assert!(states.states().values().all(|state| state.is_terminal()));
    }

    #[tokio::test]
    async fn test_task_state_unknown_query_is_not_found() {
        let storage = storage();
        let key = TaskKey::new(0, QueryKey::new("default", "nope", "EventQuery"));

        let err = storage
            .update_task_state(&key, TaskState::Completed)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_task_states_replaces_record() {
        let storage = storage();
        let task_key = create(&storage, 1).await;

        let mut states = TaskStates::new(task_key.query_key.clone(), 4);
        states.set_state(0, TaskState::Completed);
        states.set_state(1, TaskState::Ready);
        storage.update_task_states(&states).await.unwrap();

        let stored = storage
            .get_task_states(task_key.query_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, states);
        assert_eq!(stored.max_running, 4);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_exceed_budget() {
        let storage = storage();
        let task_key = create(&storage, 3).await;
        let checkpoint = QueryCheckpoint::new(task_key.query_key.clone(), json!({}));
        let mut keys = vec![task_key.clone()];
        for _ in 0..9 {
            keys.push(
                storage
                    .create_task(QueryAction::Next, checkpoint.clone())
                    .await
                    .unwrap()
                    .task_key,
            );
        }

        let mut handles = Vec::new();
        for key in keys {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.update_task_state(&key, TaskState::Running).await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        let states = storage
            .get_task_states(task_key.query_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(states.running_count(), 3);
    }

    #[tokio::test]
    async fn test_ready_tasks_lists_claimable_work() {
        let storage = storage();
        let task_key = create(&storage, 1).await;

        let ready = storage.ready_tasks().await.unwrap();
        assert_eq!(ready, vec![(task_key.query_key.clone(), vec![task_key.task_id])]);

        storage
            .update_task_state(&task_key, TaskState::Running)
            .await
            .unwrap();
        assert!(storage.ready_tasks().await.unwrap().is_empty());
    }

    // ============================================================
    // RESULTS QUEUE
    // ============================================================

    #[tokio::test]
    async fn test_results_queue_round_trip() {
        let storage = storage();
        let task_key = create(&storage, 1).await;
        let query_id = task_key.query_id();
        let queues = storage.queue_manager();
        let mut listener = queues.create_listener("listener-1", query_id).await.unwrap();

        let result = QueryResult::new("page-0", json!({"events": [1, 2, 3]}));
        queues.send_message(query_id, &result).await.unwrap();

        assert_eq!(listener.receive().await.unwrap(), Some(result));
        listener.stop();
    }
}
