//! Query Task Executor Module
//!
//! Drives query execution on top of the storage facade.
//!
//! ## Architecture Overview
//! The executor follows a **pull-based** model:
//! 1. **Discovery**: workers scan for `Ready` tasks of `Created` queries.
//! 2. **Admission**: a worker claims a task by moving it to `Running`. The move is
//!    refused once the query is at its running-task budget, which caps how much of
//!    the pool one query can occupy.
//! 3. **Execution**: the query logic registered for the query runs the task from
//!    its checkpoint and returns results plus an optional follow-up task.
//! 4. **Retirement**: results are published, the follow-up task is created and the
//!    finished task is deleted and marked `Completed`. A logic error marks the task
//!    and the query `Failed`.
//!
//! ## Submodules
//! - **`executor`**: the worker pool and the claim -> run -> retire lifecycle.
//! - **`registry`**: maps query logic names to executable async closures.

pub mod executor;
pub mod registry;
