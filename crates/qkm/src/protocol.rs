//! Typed request and response records for the delivery protocol.
//!
//! Requests carry raw strings as received from a transport; they are
//! validated here, at the boundary, before any lifecycle code runs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use qkm_core::{Identity, KeyId, KeyMaterial, KeyRecord, KeySummary};
use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::error::{ErrorKind, KmError, Result};

/// Longest key id accepted from a caller.
pub const MAX_KEY_ID_LEN: usize = 128;

/// Default page size for [`ListKeys`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Largest page size for [`ListKeys`].
pub const MAX_LIST_LIMIT: usize = 1000;

/// Initiator asks for a fresh key shared with `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestKey {
    pub requester: String,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bits: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// A [`RequestKey`] that passed validation.
#[derive(Debug, Clone)]
pub struct ValidRequest {
    pub requester: Identity,
    pub recipient: Identity,
    pub size_bits: usize,
    pub ttl: std::time::Duration,
}

impl RequestKey {
    pub fn new(requester: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            requester: requester.into(),
            recipient: recipient.into(),
            size_bits: None,
            ttl_seconds: None,
        }
    }

    pub fn size_bits(mut self, bits: usize) -> Self {
        self.size_bits = Some(bits);
        self
    }

    pub fn ttl_seconds(mut self, secs: u64) -> Self {
        self.ttl_seconds = Some(secs);
        self
    }

    /// Validate against `config`, filling in defaults.
    pub fn validate(&self, config: &ServiceConfig) -> Result<ValidRequest> {
        let requester = parse_identity("requester", &self.requester)?;
        let recipient = parse_identity("recipient", &self.recipient)?;

        let size_bits = self.size_bits.unwrap_or(config.default_key_size_bits);
        if !config.size_allowed(size_bits) {
            return Err(KmError::InvalidSize {
                bits: size_bits,
                min: config.min_key_size_bits,
                max: config.max_key_size_bits,
            });
        }

        let ttl = match self.ttl_seconds {
            Some(0) => return Err(KmError::InvalidRequest("ttl_seconds must be positive".into())),
            Some(secs) => std::time::Duration::from_secs(secs),
            None => config.default_ttl,
        };

        Ok(ValidRequest {
            requester,
            recipient,
            size_bits,
            ttl,
        })
    }
}

/// A delivered key half.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDelivery {
    pub key_id: String,
    pub key_material_b64: String,
    pub size_bits: usize,
    pub algorithm: String,
    pub expires_at: i64,
}

impl KeyDelivery {
    pub(crate) fn new(record: &KeyRecord, material: &KeyMaterial) -> Self {
        Self {
            key_id: record.key_id.to_string(),
            key_material_b64: BASE64.encode(material.as_bytes()),
            size_bits: record.key_size_bits,
            algorithm: record.algorithm.clone(),
            expires_at: record.expires_at,
        }
    }

    /// Decode the delivered key bytes.
    pub fn material(&self) -> Result<KeyMaterial> {
        BASE64
            .decode(&self.key_material_b64)
            .map(KeyMaterial::new)
            .map_err(|e| KmError::InvalidRequest(format!("key material is not base64: {e}")))
    }
}

impl std::fmt::Debug for KeyDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDelivery")
            .field("key_id", &self.key_id)
            .field("key_material_b64", &"[REDACTED]")
            .field("size_bits", &self.size_bits)
            .field("algorithm", &self.algorithm)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Recipient (or initiator) asks for a key half by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveKey {
    pub key_id: String,
    pub requester: String,
}

impl RetrieveKey {
    pub fn new(key_id: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            requester: requester.into(),
        }
    }

    pub fn validate(&self) -> Result<(KeyId, Identity)> {
        Ok((parse_key_id(&self.key_id)?, parse_identity("requester", &self.requester)?))
    }
}

/// Confirmation that a key was used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeKey {
    pub key_id: String,
    pub requester: String,
}

impl ConsumeKey {
    pub fn new(key_id: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            requester: requester.into(),
        }
    }

    pub fn validate(&self) -> Result<(KeyId, Identity)> {
        Ok((parse_key_id(&self.key_id)?, parse_identity("requester", &self.requester)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeResponse {
    /// Always `"consumed"`.
    pub status: String,
    pub key_id: String,
}

impl ConsumeResponse {
    pub(crate) fn consumed(key_id: &KeyId) -> Self {
        Self {
            status: "consumed".to_string(),
            key_id: key_id.to_string(),
        }
    }
}

/// Aggregate counts by state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub stored_count: u64,
    pub cached_count: u64,
    pub served_count: u64,
    pub consumed_count: u64,
    /// Records past expiry and not yet purged. Not included in the others.
    pub expired_count: u64,
    pub error_rate_configured: f64,
    pub sessions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed_count: u64,
}

/// Metadata listing for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListKeys {
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ListKeys {
    pub fn validate(&self) -> Result<(Identity, usize)> {
        let identity = parse_identity("identity", &self.identity)?;
        let limit = match self.limit {
            Some(0) => return Err(KmError::InvalidRequest("limit must be positive".into())),
            Some(n) => n.min(MAX_LIST_LIMIT),
            None => DEFAULT_LIST_LIMIT,
        };
        Ok((identity, limit))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListKeysResponse {
    pub keys: Vec<KeySummary>,
}

/// A published KEM public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemKeyResponse {
    pub identity: String,
    pub algorithm: String,
    pub public_key_b64: String,
}

/// Wire form of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

impl From<&KmError> for ErrorResponse {
    fn from(err: &KmError) -> Self {
        Self {
            kind: err.kind(),
            status: err.http_status(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn parse_identity(field: &str, raw: &str) -> Result<Identity> {
    Identity::parse(raw).map_err(|e| KmError::InvalidRequest(format!("{field}: {e}")))
}

pub(crate) fn parse_key_id(raw: &str) -> Result<KeyId> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(KmError::InvalidRequest("key_id is empty".into()));
    }
    if trimmed.len() > MAX_KEY_ID_LEN {
        return Err(KmError::InvalidRequest(format!(
            "key_id longer than {MAX_KEY_ID_LEN} bytes"
        )));
    }
    Ok(KeyId::new(trimmed))
}

pub(crate) fn decode_b64(field: &str, raw: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(raw.trim())
        .map_err(|e| KmError::InvalidRequest(format!("{field} is not base64: {e}")))
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_request_defaults_and_bounds() {
        let config = ServiceConfig::default();

        let valid = RequestKey::new("alice@example.com", "bob@example.com")
            .validate(&config)
            .unwrap();
        assert_eq!(valid.size_bits, 256);
        assert_eq!(valid.ttl, Duration::from_secs(3600));

        let err = RequestKey::new("alice@example.com", "bob@example.com")
            .size_bits(4)
            .validate(&config)
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidSize { bits: 4, .. }));

        let err = RequestKey::new("alice@example.com", "bob@example.com")
            .size_bits(10_000)
            .validate(&config)
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidSize { .. }));

        let err = RequestKey::new("alice", "bob@example.com")
            .validate(&config)
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidRequest(_)));

        let err = RequestKey::new("alice@example.com", "bob@example.com")
            .ttl_seconds(0)
            .validate(&config)
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidRequest(_)));
    }

    #[test]
    fn test_request_json_shape() {
        let req: RequestKey = serde_json::from_str(
            r#"{"requester":"alice@example.com","recipient":"bob@example.com","size_bits":512}"#,
        )
        .unwrap();
        assert_eq!(req.size_bits, Some(512));
        assert_eq!(req.ttl_seconds, None);
    }

    #[test]
    fn test_key_id_validation() {
        assert!(parse_key_id("  ").is_err());
        assert!(parse_key_id(&"k".repeat(MAX_KEY_ID_LEN + 1)).is_err());
        assert_eq!(parse_key_id(" abc ").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_list_limit_clamped() {
        let (_, limit) = ListKeys {
            identity: "alice@example.com".into(),
            limit: Some(1_000_000),
        }
        .validate()
        .unwrap();
        assert_eq!(limit, MAX_LIST_LIMIT);
    }

    #[test]
    fn test_delivery_debug_redacts_material() {
        let delivery = KeyDelivery {
            key_id: "k".into(),
            key_material_b64: "c2VjcmV0".into(),
            size_bits: 48,
            algorithm: "BB84-SIM".into(),
            expires_at: 0,
        };
        assert!(!format!("{delivery:?}").contains("c2VjcmV0"));
        assert_eq!(delivery.material().unwrap().as_bytes(), b"secret");
    }

    #[test]
    fn test_error_response() {
        let err = KmError::Forbidden("nope".into());
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.kind, ErrorKind::Forbidden);
        assert_eq!(resp.status, 403);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""kind":"forbidden""#));
    }
}
