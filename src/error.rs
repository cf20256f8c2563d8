//! Error types for the Floodgate rate limiter.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// None of these ever reach a caller of the decision path; the limiter logs
/// them and fails open.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Window store errors that are not plain I/O
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored window could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A string that is not a 64-character hex digest
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for FloodgateError {
    fn from(e: config::ConfigError) -> Self {
        FloodgateError::Config(e.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
