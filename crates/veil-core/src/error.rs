//! Error types for the Veil core library.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Veil operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filter rule could not be compiled
    #[error("Invalid filter rule {rule_id}: {reason}")]
    FilterRule { rule_id: String, reason: String },

    /// Permission store error
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
