use crate::config::QueryExpirationProperties;
use crate::query::types::{QueryState, QueryStatus};
use crate::storage::cache::QueryStorageCache;
use crate::storage::error::StorageResult;

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a query was expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Idle,
    CallTimeout,
}

pub struct ExpirationReaper {
    storage: Arc<QueryStorageCache>,
    properties: QueryExpirationProperties,
}

impl ExpirationReaper {
    pub fn new(storage: Arc<QueryStorageCache>, properties: QueryExpirationProperties) -> Arc<Self> {
        Arc::new(Self {
            storage,
            properties,
        })
    }

    /// Whether `status` has expired at `now`, and why.
    pub fn check(&self, status: &QueryStatus, now: DateTime<Utc>) -> Option<Expiry> {
        if status.query_state != QueryState::Created {
            return None;
        }

        let idle_timeout = to_delta(self.properties.idle_timeout);
        if let Some(last_used) = status.last_used
            && now - last_used > idle_timeout
        {
            return Some(Expiry::Idle);
        }

        let call_timeout = to_delta(self.properties.call_timeout);
        if status.concurrent_next_count > 0
            && let Some(last_updated) = status.last_updated
            && now - last_updated > call_timeout
        {
            return Some(Expiry::CallTimeout);
        }

        None
    }

    /// Cancels every expired query. Returns the ids of the cancelled queries.
    pub async fn sweep(&self, now: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let mut cancelled = Vec::new();

        for status in self.storage.get_all_query_status().await? {
            if self.check(&status, now).is_none() {
                continue;
            }

            let query_id = status.query_id().to_string();
            let expired = self
                .storage
                .update_query_status_with(&query_id, |current| {
                    // Re-check against the locked record; it may have been touched.
                    let expiry = self.check(current, now);
                    if let Some(expiry) = expiry {
                        current.query_state = QueryState::Canceled;
                        current.failure_message = Some(match expiry {
                            Expiry::Idle => "query expired: idle timeout".to_string(),
                            Expiry::CallTimeout => "query expired: call timeout".to_string(),
                        });
                    }
                    expiry
                })
                .await;

            match expired {
                Ok(Some(expiry)) => {
                    tracing::info!("Cancelled query {} ({:?})", query_id, expiry);
                    cancelled.push(query_id);
                }
                Ok(None) => {}
                // Deleted since the scan.
                Err(e) if e.is_not_found() => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Skipping expiry of query {} this round: {}", query_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(cancelled)
    }

    /// Sweeps every reaper interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            "Expiration reaper started (idle {:?}, call {:?})",
            self.properties.idle_timeout,
            self.properties.call_timeout
        );

        let mut interval = tokio::time::interval(self.properties.reaper_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(cancelled) if !cancelled.is_empty() => {
                            tracing::info!("Expired {} queries", cancelled.len());
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Expiration sweep failed: {}", e),
                    }
                }
            }
        }

        tracing::info!("Expiration reaper stopped");
    }
}

fn to_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
