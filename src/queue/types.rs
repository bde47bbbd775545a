use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was deleted or the manager shut down while the listener was live.
    #[error("listener {0} disconnected")]
    Disconnected(String),

    /// The listener's buffer stayed full for the whole send timeout.
    #[error("listener {listener_id} of query {query_id} is not draining its results")]
    ListenerFull {
        listener_id: String,
        query_id: String,
    },

    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue manager is shut down")]
    Closed,
}
