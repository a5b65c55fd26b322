//! Error types for telestash-core

use thiserror::Error;

/// Main error type for the telestash-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device identity could not be constructed or changed
    #[error("invalid device identity: {0}")]
    InvalidIdentity(String),

    /// Event failed validation
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Transport setup error (never raised for individual deliveries)
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for telestash-core
pub type Result<T> = std::result::Result<T, Error>;
