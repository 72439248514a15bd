//! Error types for quotagate.

use thiserror::Error;

/// Main error type for quotagate operations.
///
/// Permission denials are not errors; they are returned as
/// [`Permission`](crate::ratelimit::Permission) values.
#[derive(Error, Debug)]
pub enum QuotaGateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Quota ledger storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed caller input (unknown strategy, unknown error type, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An outcome was recorded for a request that holds no permission
    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    /// A permission was requested for an id that is already in flight
    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for QuotaGateError {
    fn from(err: ::config::ConfigError) -> Self {
        QuotaGateError::Config(err.to_string())
    }
}

/// Result type alias for quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaGateError>;
