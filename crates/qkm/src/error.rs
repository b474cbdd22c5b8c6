//! Error types for the key manager facade.

use std::time::Duration;

use qkm_core::{CoreError, KeyState};
use qkm_crypto::CryptoError;
use qkm_store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during key manager operations.
#[derive(Debug, Error)]
pub enum KmError {
    /// Unknown key id, or no KEM key for an identity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller identity is not the party the record is bound to.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A KEM keypair is already registered for the identity.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Record is past its TTL.
    #[error("key {0} has expired")]
    Expired(String),

    /// Lifecycle violation.
    #[error("key {key_id} is {state}: {reason}")]
    InvalidState {
        key_id: String,
        state: KeyState,
        reason: &'static str,
    },

    /// Requested key size outside policy bounds.
    #[error("invalid key size: {bits} bits (allowed {min}..={max})")]
    InvalidSize { bits: usize, min: usize, max: usize },

    /// The simulated channel could not converge.
    #[error("key agreement failed: {0}")]
    AgreementFailure(String),

    /// Tag mismatch, malformed ciphertext or KEM failure.
    #[error("crypto failure: {0}")]
    CryptoFailure(#[source] CryptoError),

    /// An operation exceeded the configured I/O bound.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// Request failed boundary validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broken internal invariant (corrupted record, poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

impl KmError {
    /// The flat outcome class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Expired(_) => ErrorKind::Expired,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidSize { .. } => ErrorKind::InvalidSize,
            Self::AgreementFailure(_) => ErrorKind::AgreementFailure,
            Self::CryptoFailure(_) => ErrorKind::CryptoFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status for this error.
    ///
    /// Same as [`ErrorKind::http_status`], except that touching a consumed
    /// key reports 410 like an expired one.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidState {
                state: KeyState::Consumed,
                ..
            } => 410,
            other => other.kind().http_status(),
        }
    }

    pub(crate) fn invalid_state(key_id: &qkm_core::KeyId, state: KeyState, reason: &'static str) -> Self {
        Self::InvalidState {
            key_id: key_id.to_string(),
            state,
            reason,
        }
    }
}

impl From<CoreError> for KmError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AgreementFailure(msg) => Self::AgreementFailure(msg),
            CoreError::InvalidSize(bits) => Self::InvalidRequest(format!("invalid key size: {bits} bits")),
            CoreError::InvalidIdentity(msg) => Self::InvalidRequest(format!("invalid identity: {msg}")),
            other @ (CoreError::MaterialSizeMismatch { .. } | CoreError::MalformedRecord(_)) => {
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<CryptoError> for KmError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnknownMode(tag) => Self::InvalidRequest(format!("unknown security mode: {tag}")),
            other => Self::CryptoFailure(other),
        }
    }
}

/// Flat classification of [`KmError`] for protocol callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Expired,
    AlreadyExists,
    InvalidState,
    InvalidSize,
    AgreementFailure,
    CryptoFailure,
    Timeout,
    InvalidRequest,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Forbidden => 403,
            Self::Expired => 410,
            Self::InvalidState | Self::AlreadyExists => 409,
            Self::InvalidSize | Self::InvalidRequest => 400,
            Self::CryptoFailure => 422,
            Self::AgreementFailure => 503,
            Self::Timeout => 504,
            Self::Storage | Self::Internal => 500,
        }
    }
}

/// Result type for key manager operations.
pub type Result<T> = std::result::Result<T, KmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use qkm_core::KeyId;

    #[test]
    fn test_status_mapping() {
        assert_eq!(KmError::NotFound("k".into()).http_status(), 404);
        assert_eq!(KmError::Forbidden("k".into()).http_status(), 403);
        assert_eq!(KmError::Expired("k".into()).http_status(), 410);
        assert_eq!(KmError::AlreadyExists("bob".into()).http_status(), 409);
        assert_eq!(
            KmError::InvalidSize { bits: 4, min: 8, max: 8192 }.http_status(),
            400
        );

        let id = KeyId::new("k1");
        assert_eq!(
            KmError::invalid_state(&id, KeyState::Consumed, "already consumed").http_status(),
            410
        );
        assert_eq!(
            KmError::invalid_state(&id, KeyState::Stored, "not yet retrieved").http_status(),
            409
        );
    }

    #[test]
    fn test_core_errors_map_to_taxonomy() {
        let err: KmError = CoreError::AgreementFailure("qber".into()).into();
        assert_eq!(err.kind(), ErrorKind::AgreementFailure);

        let err: KmError = CoreError::InvalidIdentity("no @".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_crypto_errors_map_to_taxonomy() {
        let err: KmError = CryptoError::DecryptionError("tag".into()).into();
        assert_eq!(err.kind(), ErrorKind::CryptoFailure);

        let err: KmError = CryptoError::UnknownMode("rot13".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }
}
