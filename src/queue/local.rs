//! In-process result queues.
//!
//! Each listener owns a bounded `flume` channel. Publishing clones the current
//! subscriber list and sends to every channel, so a slow listener applies
//! backpressure to the publisher instead of dropping results. A listener whose
//! buffer stays full for the send timeout is reported as `ListenerFull`; the
//! remaining listeners still get the result.

use super::manager::{QueryQueueListener, QueryQueueManager};
use super::types::QueueError;
use crate::config::QueueConfig;
use crate::query::types::QueryResult;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

type Registry = DashMap<String, Vec<Subscriber>>;

struct Subscriber {
    subscription: Uuid,
    listener_id: String,
    sender: flume::Sender<Vec<u8>>,
}

pub struct LocalQueueManager {
    queues: Arc<Registry>,
    capacity: usize,
    receive_timeout: Duration,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl LocalQueueManager {
    pub fn new(config: &QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            queues: Arc::new(DashMap::new()),
            capacity: config.capacity.max(1),
            receive_timeout: config.receive_timeout,
            send_timeout: config.send_timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn prune(&self, query_id: &str, dead: &[Uuid]) {
        if let Some(mut subscribers) = self.queues.get_mut(query_id) {
            subscribers.retain(|s| !dead.contains(&s.subscription));
        }
        self.queues.remove_if(query_id, |_, subscribers| subscribers.is_empty());
    }
}

#[async_trait]
impl QueryQueueManager for LocalQueueManager {
    async fn create_listener(
        &self,
        listener_id: &str,
        query_id: &str,
    ) -> Result<Box<dyn QueryQueueListener>, QueueError> {
        self.ensure_open()?;

        let (sender, receiver) = flume::bounded(self.capacity);
        let subscription = Uuid::new_v4();
        self.queues
            .entry(query_id.to_string())
            .or_default()
            .push(Subscriber {
                subscription,
                listener_id: listener_id.to_string(),
                sender,
            });

        tracing::debug!("Listener {} registered for query {}", listener_id, query_id);

        Ok(Box::new(LocalQueueListener {
            subscription,
            listener_id: listener_id.to_string(),
            query_id: query_id.to_string(),
            receiver,
            queues: self.queues.clone(),
            default_timeout: self.receive_timeout,
            stopped: false,
        }))
    }

    async fn send_message(&self, query_id: &str, result: &QueryResult) -> Result<usize, QueueError> {
        self.ensure_open()?;

        let payload = serde_json::to_vec(result)?;
        let targets: Vec<(Uuid, String, flume::Sender<Vec<u8>>)> = self
            .queues
            .get(query_id)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|s| (s.subscription, s.listener_id.clone(), s.sender.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        let mut dead = Vec::new();
        let mut stalled = None;
        for (subscription, listener_id, sender) in targets {
            let sent = tokio::time::timeout(self.send_timeout, sender.send_async(payload.clone()));
            match sent.await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(_)) => {
                    tracing::debug!("Listener {} of query {} is gone", listener_id, query_id);
                    dead.push(subscription);
                }
                Err(_) => {
                    tracing::warn!(
                        "Listener {} of query {} stayed full for {:?}",
                        listener_id,
                        query_id,
                        self.send_timeout
                    );
                    if stalled.is_none() {
                        stalled = Some(listener_id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            self.prune(query_id, &dead);
        }

        if let Some(listener_id) = stalled {
            return Err(QueueError::ListenerFull {
                listener_id,
                query_id: query_id.to_string(),
            });
        }

        tracing::trace!("Result {} of query {} sent to {} listeners", result.id, query_id, delivered);
        Ok(delivered)
    }

    async fn delete_queue(&self, query_id: &str) -> Result<(), QueueError> {
        if let Some((_, subscribers)) = self.queues.remove(query_id) {
            tracing::debug!(
                "Deleted queue of query {} ({} listeners disconnected)",
                query_id,
                subscribers.len()
            );
        }
        Ok(())
    }

    fn listener_count(&self, query_id: &str) -> usize {
        self.queues.get(query_id).map(|s| s.len()).unwrap_or(0)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.queues.clear();
        tracing::info!("Local queue manager shut down");
    }
}

pub struct LocalQueueListener {
    subscription: Uuid,
    listener_id: String,
    query_id: String,
    receiver: flume::Receiver<Vec<u8>>,
    queues: Arc<Registry>,
    default_timeout: Duration,
    stopped: bool,
}

#[async_trait]
impl QueryQueueListener for LocalQueueListener {
    fn listener_id(&self) -> &str {
        &self.listener_id
    }

    fn query_id(&self) -> &str {
        &self.query_id
    }

    async fn receive_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<QueryResult>, QueueError> {
        if self.stopped {
            return Err(QueueError::Disconnected(self.listener_id.clone()));
        }

        match tokio::time::timeout(timeout, self.receiver.recv_async()).await {
            Ok(Ok(payload)) => Ok(Some(serde_json::from_slice(&payload)?)),
            Ok(Err(flume::RecvError::Disconnected)) => {
                Err(QueueError::Disconnected(self.listener_id.clone()))
            }
            Err(_) => Ok(None),
        }
    }

    async fn receive(&mut self) -> Result<Option<QueryResult>, QueueError> {
        let timeout = self.default_timeout;
        self.receive_timeout(timeout).await
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(mut subscribers) = self.queues.get_mut(&self.query_id) {
            subscribers.retain(|s| s.subscription != self.subscription);
        }
        self.queues
            .remove_if(&self.query_id, |_, subscribers| subscribers.is_empty());

        tracing::debug!(
            "Listener {} stopped for query {}",
            self.listener_id,
            self.query_id
        );
    }
}

impl Drop for LocalQueueListener {
    fn drop(&mut self) {
        self.stop();
    }
}
