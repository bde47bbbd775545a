//! Result Queue Module
//!
//! Publish/subscribe of result pages, one logical channel per query id.
//!
//! ## Contract
//! - A listener registered for a query receives every result published for that
//!   query after it registered. There is no history replay.
//! - `send_message` fans out to all live listeners of the query. Results from one
//!   publisher arrive in send order.
//! - `receive` waits for a bounded time and returns `Ok(None)` on timeout.
//! - `stop` (or dropping the handle) deregisters the listener.
//!
//! `local` implements the contract in-process over bounded `flume` channels.
//! A broker-backed transport would implement the same `QueryQueueManager` trait.

pub mod local;
pub mod manager;
pub mod types;
