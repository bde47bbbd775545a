//! Distributed Query Storage Library
//!
//! Coordination layer for long-running queries that are split into tasks
//! (create, next page, close) and executed by whichever worker claims them.
//! All mutable execution state lives in shared, lock-guarded stores so that any
//! node can resume a query after another one fails.
//!
//! ## Architecture Modules
//! - **`query`**: Identity and record types (`QueryKey`, `TaskKey`, `QueryStatus`,
//!   `TaskStates`, `QueryTask`, checkpoints and result pages).
//! - **`lock`**: Per-(query, scope) mutual exclusion. An in-process provider for a
//!   single node and a lease-based provider backed by a lock service for a fleet.
//! - **`storage`**: Partitioned record stores, the three per-concern caches and the
//!   `QueryStorageCache` facade that orchestrates them.
//! - **`queue`**: Publish/subscribe fan-out of result pages to per-query listeners.
//! - **`executor`**: Worker pool that claims READY tasks under admission control and
//!   runs the registered query logic.
//! - **`expiration`**: Reaper that cancels queries nobody is using anymore.
//! - **`config`**: Node configuration with defaults for every knob.

pub mod config;
pub mod executor;
pub mod expiration;
pub mod lock;
pub mod query;
pub mod queue;
pub mod storage;
