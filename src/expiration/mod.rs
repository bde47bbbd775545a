//! Query Expiration Module
//!
//! Cancels open queries nobody is using any more. A `Created` query expires when
//! - its user has not touched it for longer than the idle timeout, or
//! - a `next` call is outstanding and the service has not touched the query for
//!   longer than the call timeout.
//!
//! The reaper decides and applies the change under the query's status lock, so a
//! query touched between the scan and the update survives.

pub mod reaper;
