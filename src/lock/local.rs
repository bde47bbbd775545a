//! In-process lock provider.
//!
//! One `tokio::sync::Mutex` per `(query id, scope)`, created on first use. A lock
//! handle owns the guard while held, so dropping the handle releases the lock.

use super::types::{LockError, LockProvider, LockScope, QueryStorageLock};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

type LockId = (String, LockScope);

pub struct LocalLockProvider {
    locks: DashMap<LockId, Arc<tokio::sync::Mutex<()>>>,
    timeout: Duration,
}

impl LocalLockProvider {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            locks: DashMap::new(),
            timeout,
        })
    }

    /// Number of `(query id, scope)` pairs with a live mutex.
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    fn mutex_for(&self, query_id: &str, scope: LockScope) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry((query_id.to_string(), scope))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl LockProvider for LocalLockProvider {
    fn acquire(&self, query_id: &str, scope: LockScope) -> Box<dyn QueryStorageLock> {
        Box::new(LocalLock {
            query_id: query_id.to_string(),
            scope,
            mutex: self.mutex_for(query_id, scope),
            guard: Mutex::new(None),
            timeout: self.timeout,
        })
    }

    fn forget_query(&self, query_id: &str) {
        for scope in [LockScope::QueryStatus, LockScope::TaskStates] {
            // Only drop mutexes no handle refers to and nobody holds.
            self.locks.remove_if(&(query_id.to_string(), scope), |_, mutex| {
                Arc::strong_count(mutex) == 1 && mutex.try_lock().is_ok()
            });
        }
    }
}

pub struct LocalLock {
    query_id: String,
    scope: LockScope,
    mutex: Arc<tokio::sync::Mutex<()>>,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
    timeout: Duration,
}

impl LocalLock {
    fn holds(&self) -> bool {
        self.guard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[async_trait]
impl QueryStorageLock for LocalLock {
    fn query_id(&self) -> &str {
        &self.query_id
    }

    fn scope(&self) -> LockScope {
        self.scope
    }

    async fn lock(&self) -> Result<(), LockError> {
        if self.holds() {
            return Err(LockError::AlreadyHeld {
                query_id: self.query_id.clone(),
                scope: self.scope,
            });
        }

        let acquired = tokio::time::timeout(self.timeout, self.mutex.clone().lock_owned()).await;
        match acquired {
            Ok(guard) => {
                *self.guard.lock().unwrap_or_else(|e| e.into_inner()) = Some(guard);
                tracing::trace!("Locked {} of query {}", self.scope, self.query_id);
                Ok(())
            }
            Err(_) => Err(LockError::Timeout {
                query_id: self.query_id.clone(),
                scope: self.scope,
                timeout: self.timeout,
            }),
        }
    }

    async fn unlock(&self) -> Result<(), LockError> {
        let guard = self.guard.lock().unwrap_or_else(|e| e.into_inner()).take();
        match guard {
            Some(guard) => {
                drop(guard);
                tracing::trace!("Unlocked {} of query {}", self.scope, self.query_id);
                Ok(())
            }
            None => Err(LockError::NotHeld {
                query_id: self.query_id.clone(),
                scope: self.scope,
            }),
        }
    }

    async fn is_locked(&self) -> Result<bool, LockError> {
        Ok(self.mutex.try_lock().is_err())
    }
}
