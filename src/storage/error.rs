use crate::lock::types::LockError;
use crate::query::types::{QueryKey, TaskKey};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("checkpoint key {checkpoint_key} does not match task key {task_key}")]
    InconsistentKey {
        task_key: TaskKey,
        checkpoint_key: QueryKey,
    },

    #[error("inconsistent query state: {0}")]
    InconsistentState(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Lock failures are transient; callers may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Lock(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
