//! Core error types

use thiserror::Error;

/// Core error type for TrustClient
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration is missing a value or carries an invalid one
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Logging subscriber could not be installed
    #[error("Logging initialization failed: {0}")]
    Logging(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
