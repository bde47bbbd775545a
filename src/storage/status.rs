use super::error::{StorageError, StorageResult};
use super::guard::locked;
use super::memory::RecordStore;
use crate::lock::types::{LockProvider, LockScope, QueryStorageLock};
use crate::query::types::QueryStatus;

use chrono::Utc;
use std::sync::Arc;

/// Query-status store. One record per query, keyed by query id.
pub struct QueryStatusCache {
    store: Arc<dyn RecordStore<String, QueryStatus>>,
    locks: Arc<dyn LockProvider>,
}

impl QueryStatusCache {
    pub fn new(
        store: Arc<dyn RecordStore<String, QueryStatus>>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self { store, locks }
    }

    pub fn get_query_status_lock(&self, query_id: &str) -> Box<dyn QueryStorageLock> {
        self.locks.acquire(query_id, LockScope::QueryStatus)
    }

    /// Stores `status` as-is, replacing any previous record.
    pub async fn update_query_status(&self, status: &QueryStatus) -> StorageResult<()> {
        let lock = self.get_query_status_lock(status.query_id());
        locked(lock.as_ref(), async {
            self.store.put(status.query_id().to_string(), status).await
        })
        .await
    }

    /// Read-modify-write of an existing status under its lock.
    pub async fn update_with<R, F>(&self, query_id: &str, mutate: F) -> StorageResult<R>
    where
        F: FnOnce(&mut QueryStatus) -> R + Send,
        R: Send,
    {
        let lock = self.get_query_status_lock(query_id);
        locked(lock.as_ref(), async move {
            let key = query_id.to_string();
            let mut status = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("query status {}", query_id)))?;

            let result = mutate(&mut status);
            status.touch_last_updated(Utc::now());
            self.store.put(key, &status).await?;
            Ok(result)
        })
        .await
    }

    pub async fn get_query_status(&self, query_id: &str) -> StorageResult<Option<QueryStatus>> {
        self.store.get(&query_id.to_string()).await
    }

    pub async fn get_all(&self) -> StorageResult<Vec<QueryStatus>> {
        Ok(self
            .store
            .scan_all()
            .await?
            .into_iter()
            .map(|(_, status)| status)
            .collect())
    }

    /// Returns whether a record was removed.
    pub async fn delete_query_status(&self, query_id: &str) -> StorageResult<bool> {
        let lock = self.get_query_status_lock(query_id);
        locked(lock.as_ref(), async {
            Ok(self.store.remove(&query_id.to_string()).await?.is_some())
        })
        .await
    }
}
