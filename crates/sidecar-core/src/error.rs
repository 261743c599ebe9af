//! Error types for the sidecar core library.

use thiserror::Error;

/// Result type alias using the core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for sidecar operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend protocol line could not be interpreted
    #[error("Failed to parse backend message: {0}")]
    ProtocolParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
