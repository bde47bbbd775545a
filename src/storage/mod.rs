//! Query Storage Module
//!
//! Three independent stores plus the facade that coordinates them.
//!
//! ## Stores
//! - **`status`**: one `QueryStatus` per query, mutated under the query's status lock.
//! - **`states`**: one `TaskStates` per query, mutated under the query's task-states
//!   lock. Enforces the running-task budget.
//! - **`tasks`**: one `QueryTask` per task, holding the task's checkpoint.
//!
//! ## Backend
//! Stores talk to a `RecordStore`. `MemoryStore` shards records by query id
//! (`PartitionManager`) so all of a query's records share a shard.
//!
//! ## Errors
//! Structural problems (missing records, mismatched keys) fail with a
//! `StorageError`. A budget refusal is not an error: `update_task_state` returns
//! `Ok(false)` and the caller retries later.

pub mod cache;
pub mod error;
mod guard;
pub mod memory;
pub mod partitioner;
pub mod states;
pub mod status;
pub mod tasks;

#[cfg(test)]
mod tests;
