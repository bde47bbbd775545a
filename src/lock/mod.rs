//! Query Storage Lock Module
//!
//! Exclusive locks scoped to one `(query id, scope)` pair. Every store mutation runs
//! its read-modify-write while holding the lock of its scope, so a status update and
//! a task-state update for the same query never wait on each other.
//!
//! ## Providers
//! - **`local`**: In-process mutexes keyed by `(query id, scope)`, for a single node.
//! - **`remote`**: Lease-based locks granted by a lock service over HTTP, for a fleet.
//!   Leases are renewed in the background while held, so a crashed holder loses its
//!   lock once the lease expires.
//! - **`service`**: The lock service itself (lease table + HTTP handlers).
//!
//! Locks are not reentrant: a handle that already holds its lock fails fast on a
//! second `lock()` instead of deadlocking.

pub mod local;
pub mod protocol;
pub mod remote;
pub mod service;
pub mod types;
