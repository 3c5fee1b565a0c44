//! Error types for campo-core

use thiserror::Error;

use crate::timefmt::TimeFormatError;

/// Result type alias using campo-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in campo-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Time string could not be normalized
    #[error(transparent)]
    TimeFormat(#[from] TimeFormatError),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Server rejected the request
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// A sync cycle is already running on this engine
    #[error("A sync cycle is already in progress")]
    SyncInProgress,
}
