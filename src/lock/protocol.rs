//! Lock Service Protocol
//!
//! DTOs exchanged between `RemoteLockProvider` and the lock service. A lease is
//! identified by an opaque token handed out on acquire; renew and release must
//! present it.

use super::types::LockScope;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_LOCK_ACQUIRE: &str = "/lock/acquire";
pub const ENDPOINT_LOCK_RENEW: &str = "/lock/renew";
pub const ENDPOINT_LOCK_RELEASE: &str = "/lock/release";
pub const ENDPOINT_LOCK_STATUS: &str = "/lock/status";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireLockRequest {
    pub query_id: String,
    pub scope: LockScope,
    /// Identifies the requesting process, for diagnostics only.
    pub owner: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcquireLockResponse {
    pub granted: bool,
    pub token: Option<String>,
    pub lease_expires: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenewLockRequest {
    pub query_id: String,
    pub scope: LockScope,
    pub token: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseLockRequest {
    pub query_id: String,
    pub scope: LockScope,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockOpResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockStatusResponse {
    pub locked: bool,
}
