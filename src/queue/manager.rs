use super::types::QueueError;
use crate::query::types::QueryResult;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Subscriber handle for the results of one query.
#[async_trait]
pub trait QueryQueueListener: Send {
    fn listener_id(&self) -> &str;

    fn query_id(&self) -> &str;

    /// Next result, or `Ok(None)` if nothing arrived within `timeout`.
    async fn receive_timeout(&mut self, timeout: Duration)
    -> Result<Option<QueryResult>, QueueError>;

    /// `receive_timeout` with the manager's default timeout.
    async fn receive(&mut self) -> Result<Option<QueryResult>, QueueError>;

    /// Like `receive_timeout`, but returns `Ok(None)` as soon as `cancel` fires.
    async fn receive_with_cancel(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<QueryResult>, QueueError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            result = self.receive_timeout(timeout) => result,
        }
    }

    /// Deregisters the listener. Idempotent.
    fn stop(&mut self);
}

#[async_trait]
pub trait QueryQueueManager: Send + Sync {
    async fn create_listener(
        &self,
        listener_id: &str,
        query_id: &str,
    ) -> Result<Box<dyn QueryQueueListener>, QueueError>;

    /// Publishes to every live listener of the query. Returns how many received it.
    ///
    /// Waiting on a full listener is bounded; a listener that never drains is
    /// reported as `QueueError::ListenerFull` after the others were served.
    async fn send_message(&self, query_id: &str, result: &QueryResult) -> Result<usize, QueueError>;

    /// Disconnects every listener of the query.
    async fn delete_queue(&self, query_id: &str) -> Result<(), QueueError>;

    fn listener_count(&self, query_id: &str) -> usize;

    /// Disconnects everything and refuses further use.
    async fn shutdown(&self);
}
