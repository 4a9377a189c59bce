//! Error types for fieldgate-store.

use std::path::PathBuf;

/// Result type for fieldgate-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldgate-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Database was written by a newer schema than this build understands.
    #[error("Unsupported schema version {found} (this build supports {supported})")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// Device not found in database.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device definition rejected by the registry.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<fieldgate_types::ParseError> for Error {
    fn from(err: fieldgate_types::ParseError) -> Self {
        match err {
            fieldgate_types::ParseError::InvalidDevice(msg) => Error::InvalidDevice(msg),
            other => Error::InvalidDevice(other.to_string()),
        }
    }
}
