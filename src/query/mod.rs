//! Query Model Module
//!
//! Identity and record types shared by every store.
//!
//! ## Keys
//! - **`QueryKey`**: `(pool, query id, query logic)`, the immutable identity of a query.
//! - **`TaskKey`**: a task id scoped to one `QueryKey`. Task ids are only unique
//!   within their query.
//!
//! ## Records
//! Each record belongs to exactly one store: `QueryStatus` (status store),
//! `TaskStates` (task-states store) and `QueryTask` (task store). Records refer to
//! each other by key, never by reference.

pub mod types;
