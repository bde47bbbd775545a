use super::error::StorageResult;
use crate::lock::types::QueryStorageLock;
use std::future::Future;

/// Runs `op` while holding `lock`.
///
/// The lock is released on every exit path. If both the operation and the unlock
/// fail, the operation's error wins.
pub(crate) async fn locked<T, Fut>(lock: &dyn QueryStorageLock, op: Fut) -> StorageResult<T>
where
    Fut: Future<Output = StorageResult<T>>,
{
    lock.lock().await?;
    let result = op.await;
    let unlocked = lock.unlock().await;

    match (result, unlocked) {
        (Err(e), Err(unlock_err)) => {
            tracing::warn!(
                "Failed to release {} lock of query {} after error: {}",
                lock.scope(),
                lock.query_id(),
                unlock_err
            );
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(unlock_err)) => Err(unlock_err.into()),
        (Ok(value), Ok(())) => Ok(value),
    }
}
