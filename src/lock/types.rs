use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The sub-store a lock protects. Scopes of the same query are independent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    QueryStatus,
    TaskStates,
}

impl LockScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryStatus => "query_status",
            Self::TaskStates => "task_states",
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockScope {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query_status" => Ok(Self::QueryStatus),
            "task_states" => Ok(Self::TaskStates),
            other => Err(LockError::Protocol(format!("unknown lock scope: {}", other))),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for {scope} lock of query {query_id}")]
    Timeout {
        query_id: String,
        scope: LockScope,
        timeout: Duration,
    },

    #[error("{scope} lock of query {query_id} is not held by this handle")]
    NotHeld { query_id: String, scope: LockScope },

    #[error("{scope} lock of query {query_id} is already held by this handle")]
    AlreadyHeld { query_id: String, scope: LockScope },

    #[error("wait for {scope} lock of query {query_id} was cancelled")]
    Cancelled { query_id: String, scope: LockScope },

    #[error("lock service unreachable: {0}")]
    Transport(String),

    #[error("lock service protocol error: {0}")]
    Protocol(String),
}

/// Handle on the lock of one `(query id, scope)` pair.
///
/// `unlock` is only valid on the handle that locked. Dropping a handle that still
/// holds its lock releases it.
#[async_trait]
pub trait QueryStorageLock: Send + Sync {
    fn query_id(&self) -> &str;

    fn scope(&self) -> LockScope;

    /// Waits for the lock up to the provider's timeout.
    async fn lock(&self) -> Result<(), LockError>;

    /// Like `lock`, but gives up as soon as `cancel` fires.
    async fn lock_with_cancel(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled {
                query_id: self.query_id().to_string(),
                scope: self.scope(),
            }),
            result = self.lock() => result,
        }
    }

    async fn unlock(&self) -> Result<(), LockError>;

    /// Whether anyone currently holds this `(query id, scope)` lock.
    async fn is_locked(&self) -> Result<bool, LockError>;
}

pub trait LockProvider: Send + Sync {
    fn acquire(&self, query_id: &str, scope: LockScope) -> Box<dyn QueryStorageLock>;

    /// Drops bookkeeping for a deleted query. Locks still in use are kept.
    fn forget_query(&self, _query_id: &str) {}
}
