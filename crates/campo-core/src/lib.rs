//! campo-core - Core library for Campo
//!
//! This crate contains the sync wire protocol, the time normalizer, the
//! device-local store with its write-ahead queue, and the sync client used
//! by all Campo field interfaces.

pub mod db;
pub mod error;
pub mod protocol;
pub mod sync;
pub mod timefmt;

pub use error::{Error, Result};
pub use protocol::{Snapshot, UploadBatch, UploadResponse};
