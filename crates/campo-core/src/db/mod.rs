//! Device-local database layer
//!
//! A full mirror of server reference data plus the write-ahead queue of
//! field-collected records not yet acknowledged by the server.

mod migrations;
mod store;

pub use store::{LocalStore, PendingBatch, PendingCounts, QueueTable};
