//! Error types for the throttler crate.
//!
//! The limiter itself never fails; only the configuration edges do.

use thiserror::Error;

/// Main error type for throttler operations.
#[derive(Error, Debug)]
pub enum ThrottlerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for ThrottlerError {
    fn from(err: ::config::ConfigError) -> Self {
        ThrottlerError::Config(err.to_string())
    }
}

/// Result type alias for throttler operations.
pub type Result<T> = std::result::Result<T, ThrottlerError>;
