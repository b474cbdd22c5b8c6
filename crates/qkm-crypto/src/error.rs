//! Error types for the crypto module.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Decryption or authentication failure. Never carries plaintext.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Ciphertext or envelope bytes are structurally invalid.
    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// One-time pad key shorter than the data.
    #[error("one-time pad needs {needed} key bytes, have {available}")]
    LengthMismatch { needed: usize, available: usize },

    /// Key bytes of the wrong shape for the operation.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Key derivation error.
    #[error("key derivation error: {0}")]
    KeyDerivationError(String),

    /// Key encapsulation error.
    #[error("key encapsulation error: {0}")]
    KemError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Unrecognized security mode tag.
    #[error("unknown security mode: {0}")]
    UnknownMode(String),
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
