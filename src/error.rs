//! Error types for the Trustgate service.

use thiserror::Error;

/// Main error type for Trustgate operations.
#[derive(Error, Debug)]
pub enum TrustgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed rule, request or administrative input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown rule, quota or user on an admin lookup
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrustgateError {
    /// Whether this error came from the backing store.
    ///
    /// The decision path treats these as fail-open conditions.
    pub fn is_storage(&self) -> bool {
        matches!(self, TrustgateError::Storage(_))
    }
}

/// Result type alias for Trustgate operations.
pub type Result<T> = std::result::Result<T, TrustgateError>;
