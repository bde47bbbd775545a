//! Lock Service
//!
//! Grants exclusive, time-bounded leases on `(query id, scope)` pairs. An expired
//! lease is treated as free, so a holder that stops renewing loses its lock without
//! any cleanup step.

use super::protocol::*;
use super::types::LockScope;

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LeaseEntry {
    token: String,
    owner: String,
    lease_expires: u64,
}

pub struct LockTable {
    leases: DashMap<(String, LockScope), LeaseEntry>,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            leases: DashMap::new(),
        })
    }

    /// Grants a lease if the lock is free or its current lease has expired.
    /// Returns `(token, lease_expires)` on success.
    pub fn try_acquire(
        &self,
        query_id: &str,
        scope: LockScope,
        owner: &str,
        ttl_ms: u64,
    ) -> Option<(String, u64)> {
        let now = now_ms();
        let grant = || LeaseEntry {
            token: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            lease_expires: now + ttl_ms,
        };

        match self.leases.entry((query_id.to_string(), scope)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().lease_expires > now {
                    return None;
                }
                tracing::debug!(
                    "Reclaiming expired {} lease of query {} held by {}",
                    scope,
                    query_id,
                    occupied.get().owner
                );
                let entry = grant();
                let granted = (entry.token.clone(), entry.lease_expires);
                occupied.insert(entry);
                Some(granted)
            }
            Entry::Vacant(vacant) => {
                let entry = grant();
                let granted = (entry.token.clone(), entry.lease_expires);
                vacant.insert(entry);
                Some(granted)
            }
        }
    }

    /// Extends a live lease. Fails if the token no longer owns the lock.
    pub fn renew(&self, query_id: &str, scope: LockScope, token: &str, ttl_ms: u64) -> bool {
        let now = now_ms();
        match self.leases.get_mut(&(query_id.to_string(), scope)) {
            Some(mut entry) if entry.token == token && entry.lease_expires > now => {
                entry.lease_expires = now + ttl_ms;
                true
            }
            _ => false,
        }
    }

    pub fn release(&self, query_id: &str, scope: LockScope, token: &str) -> bool {
        self.leases
            .remove_if(&(query_id.to_string(), scope), |_, entry| entry.token == token)
            .is_some()
    }

    pub fn is_locked(&self, query_id: &str, scope: LockScope) -> bool {
        self.leases
            .get(&(query_id.to_string(), scope))
            .map(|entry| entry.lease_expires > now_ms())
            .unwrap_or(false)
    }

    /// Drops every expired lease. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_ms();
        let mut purged = 0;
        self.leases.retain(|_, entry| {
            let live = entry.lease_expires > now;
            if !live {
                purged += 1;
            }
            live
        });
        purged
    }
}

pub fn router(table: Arc<LockTable>) -> Router {
    Router::new()
        .route(ENDPOINT_LOCK_ACQUIRE, post(handle_acquire))
        .route(ENDPOINT_LOCK_RENEW, post(handle_renew))
        .route(ENDPOINT_LOCK_RELEASE, post(handle_release))
        .route(
            &format!("{}/:scope/:query_id", ENDPOINT_LOCK_STATUS),
            get(handle_status),
        )
        .layer(Extension(table))
}

pub async fn handle_acquire(
    Extension(table): Extension<Arc<LockTable>>,
    Json(req): Json<AcquireLockRequest>,
) -> (StatusCode, Json<AcquireLockResponse>) {
    match table.try_acquire(&req.query_id, req.scope, &req.owner, req.ttl_ms) {
        Some((token, lease_expires)) => {
            tracing::debug!(
                "Granted {} lease of query {} to {}",
                req.scope,
                req.query_id,
                req.owner
            );
            (
                StatusCode::OK,
                Json(AcquireLockResponse {
                    granted: true,
                    token: Some(token),
                    lease_expires: Some(lease_expires),
                }),
            )
        }
        None => (
            StatusCode::OK,
            Json(AcquireLockResponse {
                granted: false,
                token: None,
                lease_expires: None,
            }),
        ),
    }
}

pub async fn handle_renew(
    Extension(table): Extension<Arc<LockTable>>,
    Json(req): Json<RenewLockRequest>,
) -> (StatusCode, Json<LockOpResponse>) {
    let success = table.renew(&req.query_id, req.scope, &req.token, req.ttl_ms);
    if !success {
        tracing::warn!("Rejected renewal of {} lease of query {}", req.scope, req.query_id);
    }
    (StatusCode::OK, Json(LockOpResponse { success }))
}

pub async fn handle_release(
    Extension(table): Extension<Arc<LockTable>>,
    Json(req): Json<ReleaseLockRequest>,
) -> (StatusCode, Json<LockOpResponse>) {
    let success = table.release(&req.query_id, req.scope, &req.token);
    (StatusCode::OK, Json(LockOpResponse { success }))
}

pub async fn handle_status(
    Extension(table): Extension<Arc<LockTable>>,
    Path((scope, query_id)): Path<(String, String)>,
) -> (StatusCode, Json<Option<LockStatusResponse>>) {
    match scope.parse::<LockScope>() {
        Ok(scope) => (
            StatusCode::OK,
            Json(Some(LockStatusResponse {
                locked: table.is_locked(&query_id, scope),
            })),
        ),
        Err(e) => {
            tracing::warn!("Bad lock status request: {}", e);
            (StatusCode::BAD_REQUEST, Json(None))
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
