//! Remote lock provider.
//!
//! Acquires leases from a lock service over HTTP. While a lock is held, a background
//! task renews the lease every third of its TTL. If the holder dies the renewals
//! stop and the service frees the lock once the lease runs out.

use super::protocol::*;
use super::types::{LockError, LockProvider, LockScope, QueryStorageLock};
use crate::config::LockConfig;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const MAX_POLL_DELAY: Duration = Duration::from_millis(1200);

/// HTTP client shared by every lock handle of one provider.
struct LockClient {
    http_client: reqwest::Client,
    base_url: String,
    owner: String,
    settings: LockConfig,
}

impl LockClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ttl_ms(&self) -> u64 {
        self.settings.lease_ttl.as_millis() as u64
    }

    async fn post<T, R>(&self, path: &str, payload: &T) -> Result<R, LockError>
    where
        T: serde::Serialize,
        R: DeserializeOwned,
    {
        let response = self.post_with_retry(self.url(path), payload).await?;
        decode(response).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, LockError> {
        let response = self.get_with_retry(self.url(path)).await?;
        decode(response).await
    }

    /// Asks the service for a lease on a detached task. If the caller gives up
    /// while the request is in flight, a lease granted after that is released
    /// instead of being left to expire.
    async fn request_lease(
        self: &Arc<Self>,
        request: AcquireLockRequest,
    ) -> Result<AcquireLockResponse, LockError> {
        let (reply, answer) = tokio::sync::oneshot::channel();
        let client = self.clone();

        tokio::spawn(async move {
            let resp = client
                .post::<_, AcquireLockResponse>(ENDPOINT_LOCK_ACQUIRE, &request)
                .await;
            if let Err(Ok(AcquireLockResponse {
                granted: true,
                token: Some(token),
                ..
            })) = reply.send(resp)
            {
                tracing::debug!(
                    "Releasing abandoned {} lease of query {}",
                    request.scope,
                    request.query_id
                );
                let release = ReleaseLockRequest {
                    query_id: request.query_id,
                    scope: request.scope,
                    token,
                };
                if let Err(e) = client
                    .post::<_, LockOpResponse>(ENDPOINT_LOCK_RELEASE, &release)
                    .await
                {
                    tracing::debug!("Release of abandoned lease failed: {}", e);
                }
            }
        });

        answer
            .await
            .map_err(|_| LockError::Transport("acquire request was aborted".to_string()))?
    }

    // --- HTTP Helpers with Backoff ---

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
    ) -> Result<reqwest::Response, LockError> {
        let attempts = self.settings.request_attempts.max(1);
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.settings.request_timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(LockError::Transport(e.to_string()));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(LockError::Transport("retry attempts exhausted".to_string()))
    }

    async fn get_with_retry(&self, url: String) -> Result<reqwest::Response, LockError> {
        let attempts = self.settings.request_attempts.max(1);
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .get(url.clone())
                .timeout(self.settings.request_timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(LockError::Transport(e.to_string()));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(LockError::Transport("retry attempts exhausted".to_string()))
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, LockError> {
    let response = response
        .error_for_status()
        .map_err(|e| LockError::Protocol(e.to_string()))?;
    response
        .json::<R>()
        .await
        .map_err(|e| LockError::Protocol(e.to_string()))
}

pub struct RemoteLockProvider {
    client: Arc<LockClient>,
}

impl RemoteLockProvider {
    /// `base_url` is the lock service root, e.g. `http://10.0.0.5:7400`.
    pub fn new(base_url: impl Into<String>, settings: LockConfig) -> Arc<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Arc::new(Self {
            client: Arc::new(LockClient {
                http_client: reqwest::Client::new(),
                base_url,
                owner: Uuid::new_v4().to_string(),
                settings,
            }),
        })
    }

    pub fn owner(&self) -> &str {
        &self.client.owner
    }
}

impl LockProvider for RemoteLockProvider {
    fn acquire(&self, query_id: &str, scope: LockScope) -> Box<dyn QueryStorageLock> {
        Box::new(RemoteLock {
            query_id: query_id.to_string(),
            scope,
            client: self.client.clone(),
            held: Mutex::new(None),
        })
    }
}

struct HeldLease {
    token: String,
    renewal: JoinHandle<()>,
}

pub struct RemoteLock {
    query_id: String,
    scope: LockScope,
    client: Arc<LockClient>,
    held: Mutex<Option<HeldLease>>,
}

impl RemoteLock {
    fn take_lease(&self) -> Option<HeldLease> {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn spawn_renewal(&self, token: String) -> JoinHandle<()> {
        let client = self.client.clone();
        let request = RenewLockRequest {
            query_id: self.query_id.clone(),
            scope: self.scope,
            token,
            ttl_ms: client.ttl_ms(),
        };
        let period = (client.settings.lease_ttl / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match client
                    .post::<_, LockOpResponse>(ENDPOINT_LOCK_RENEW, &request)
                    .await
                {
                    Ok(resp) if resp.success => {
                        tracing::trace!(
                            "Renewed {} lease of query {}",
                            request.scope,
                            request.query_id
                        );
                    }
                    Ok(_) => {
                        tracing::warn!(
                            "Lost {} lease of query {}",
                            request.scope,
                            request.query_id
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to renew {} lease of query {}: {}",
                            request.scope,
                            request.query_id,
                            e
                        );
                    }
                }
            }
        })
    }
}

#[async_trait]
impl QueryStorageLock for RemoteLock {
    fn query_id(&self) -> &str {
        &self.query_id
    }

    fn scope(&self) -> LockScope {
        self.scope
    }

    async fn lock(&self) -> Result<(), LockError> {
        if self.held.lock().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Err(LockError::AlreadyHeld {
                query_id: self.query_id.clone(),
                scope: self.scope,
            });
        }

        let timeout = self.client.settings.lock_timeout;
        let deadline = Instant::now() + timeout;
        let mut delay = self.client.settings.poll_interval;
        let request = AcquireLockRequest {
            query_id: self.query_id.clone(),
            scope: self.scope,
            owner: self.client.owner.clone(),
            ttl_ms: self.client.ttl_ms(),
        };

        loop {
            let resp = self.client.request_lease(request.clone()).await?;

            if resp.granted {
                let token = resp.token.ok_or_else(|| {
                    LockError::Protocol("lease granted without a token".to_string())
                })?;
                let renewal = self.spawn_renewal(token.clone());
                *self.held.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(HeldLease { token, renewal });
                tracing::trace!("Locked {} of query {}", self.scope, self.query_id);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    query_id: self.query_id.clone(),
                    scope: self.scope,
                    timeout,
                });
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % 50);
            tokio::time::sleep((delay + jitter).min(deadline - now)).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
    }

    async fn unlock(&self) -> Result<(), LockError> {
        let Some(lease) = self.take_lease() else {
            return Err(LockError::NotHeld {
                query_id: self.query_id.clone(),
                scope: self.scope,
            });
        };
        lease.renewal.abort();

        let request = ReleaseLockRequest {
            query_id: self.query_id.clone(),
            scope: self.scope,
            token: lease.token,
        };
        let resp: LockOpResponse = self.client.post(ENDPOINT_LOCK_RELEASE, &request).await?;
        if !resp.success {
            // The lease expired before we released it.
            return Err(LockError::NotHeld {
                query_id: self.query_id.clone(),
                scope: self.scope,
            });
        }

        tracing::trace!("Unlocked {} of query {}", self.scope, self.query_id);
        Ok(())
    }

    async fn is_locked(&self) -> Result<bool, LockError> {
        let path = format!("{}/{}/{}", ENDPOINT_LOCK_STATUS, self.scope, self.query_id);
        let resp: LockStatusResponse = self.client.get(&path).await?;
        Ok(resp.locked)
    }
}

impl Drop for RemoteLock {
    fn drop(&mut self) {
        let Some(lease) = self.take_lease() else {
            return;
        };
        lease.renewal.abort();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "Dropped {} lock of query {} outside a runtime; lease will expire",
                self.scope,
                self.query_id
            );
            return;
        };

        let client = self.client.clone();
        let request = ReleaseLockRequest {
            query_id: self.query_id.clone(),
            scope: self.scope,
            token: lease.token,
        };
        handle.spawn(async move {
            if let Err(e) = client
                .post::<_, LockOpResponse>(ENDPOINT_LOCK_RELEASE, &request)
                .await
            {
                tracing::debug!("Release on drop failed: {}", e);
            }
        });
    }
}
