//! Error types for the key manager core.

use thiserror::Error;

/// Core errors raised by pure computation (no I/O).
#[derive(Debug, Error)]
pub enum CoreError {
    /// The simulated channel cannot converge on an agreed key.
    #[error("key agreement failed: {0}")]
    AgreementFailure(String),

    /// Requested key size is unusable.
    #[error("invalid key size: {0} bits")]
    InvalidSize(usize),

    /// Identity string failed validation.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Key material does not match its declared size.
    #[error("key material is {actual} bytes, expected {expected} for declared size")]
    MaterialSizeMismatch { expected: usize, actual: usize },

    /// Malformed persisted data.
    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
