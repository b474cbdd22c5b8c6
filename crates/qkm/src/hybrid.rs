//! Message encryption for the mail system.
//!
//! [`SecureMail`] picks the key source for a [`SecurityMode`], obtains key
//! material from the delivery service, and runs the mode's scheme. The
//! delivered `key_id` is bound as associated data in every AEAD mode.

use std::sync::Arc;

use qkm_core::KeyId;
use qkm_crypto::{KeySource, ModeKey, SecurityMode};
use qkm_store::Store;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::delivery::KeyDeliveryService;
use crate::error::{KmError, Result};
use crate::protocol::{decode_b64, encode_b64, parse_identity, parse_key_id, ValidRequest};

/// An encrypted message and what the recipient needs to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptResponse {
    pub ciphertext_b64: String,
    /// `None` for pass-through.
    pub key_id: Option<String>,
    pub algorithm: String,
    pub security_mode: String,
    pub nonce_size: usize,
    pub tag_size: usize,
}

/// Encrypt/decrypt boundary consumed by the mail system.
pub struct SecureMail<S: Store> {
    service: Arc<KeyDeliveryService<S>>,
}

impl<S: Store> Clone for SecureMail<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<S: Store> SecureMail<S> {
    pub fn new(service: Arc<KeyDeliveryService<S>>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<KeyDeliveryService<S>> {
        &self.service
    }

    /// Encrypt `plaintext` from `requester` to `recipient`.
    pub async fn encrypt(
        &self,
        mode: SecurityMode,
        plaintext: &[u8],
        requester: &str,
        recipient: &str,
    ) -> Result<EncryptResponse> {
        let requester = parse_identity("requester", requester)?;
        let recipient = parse_identity("recipient", recipient)?;
        let scheme = mode.scheme();

        let (ciphertext, key_id) = match scheme.key_source() {
            KeySource::None => (scheme.protect(plaintext, ModeKey::None, &[])?, None),
            KeySource::Delivered { .. } => {
                let request = ValidRequest {
                    size_bits: self.key_size_for(mode, plaintext.len())?,
                    ttl: self.service.config().default_ttl,
                    requester,
                    recipient,
                };
                let fetched = self.service.deliver(&request).await?;
                let key_id = fetched.record.key_id.clone();
                let ciphertext = scheme.protect(
                    plaintext,
                    ModeKey::Shared(fetched.material.as_bytes()),
                    key_id.as_str().as_bytes(),
                )?;
                (ciphertext, Some(key_id))
            }
            KeySource::KemDirectory => {
                let public = self.service.ensure_kem(&recipient).await?;
                let key_id = KeyId::generate();
                let ciphertext = scheme.protect(
                    plaintext,
                    ModeKey::KemPublic(&public),
                    key_id.as_str().as_bytes(),
                )?;
                (ciphertext, Some(key_id))
            }
        };

        debug!(
            mode = %mode,
            key_id = ?key_id.as_ref().map(KeyId::as_str),
            len = plaintext.len(),
            "encrypted message"
        );

        Ok(EncryptResponse {
            ciphertext_b64: encode_b64(&ciphertext),
            key_id: key_id.map(|id| id.to_string()),
            algorithm: scheme.algorithm().to_string(),
            security_mode: mode.as_str().to_string(),
            nonce_size: scheme.nonce_size(),
            tag_size: scheme.tag_size(),
        })
    }

    /// Decrypt a message addressed to `requester`.
    ///
    /// Single-use keys are consumed only after the message authenticates.
    pub async fn decrypt(
        &self,
        mode: SecurityMode,
        ciphertext_b64: &str,
        key_id: Option<&str>,
        requester: &str,
    ) -> Result<Vec<u8>> {
        let requester = parse_identity("requester", requester)?;
        let ciphertext = decode_b64("ciphertext_b64", ciphertext_b64)?;
        let scheme = mode.scheme();

        match scheme.key_source() {
            KeySource::None => Ok(scheme.unprotect(&ciphertext, ModeKey::None, &[])?),
            KeySource::Delivered { single_use } => {
                let key_id = required_key_id(mode, key_id)?;
                let fetched = self.service.retrieve(&key_id, &requester).await?;
                let plaintext = scheme.unprotect(
                    &ciphertext,
                    ModeKey::Shared(fetched.material.as_bytes()),
                    key_id.as_str().as_bytes(),
                )?;
                if single_use {
                    self.service.consume(&key_id, &requester).await?;
                }
                debug!(mode = %mode, key_id = %key_id, "decrypted message");
                Ok(plaintext)
            }
            KeySource::KemDirectory => {
                let key_id = required_key_id(mode, key_id)?;
                let private = self.service.kem_private(&requester, &requester).await?;
                let plaintext = scheme.unprotect(
                    &ciphertext,
                    ModeKey::KemPrivate(&private),
                    key_id.as_str().as_bytes(),
                )?;
                debug!(mode = %mode, key_id = %key_id, "decrypted message");
                Ok(plaintext)
            }
        }
    }

    /// Key size to request for a delivered-key mode.
    ///
    /// The one-time pad needs at least one key bit per plaintext bit.
    fn key_size_for(&self, mode: SecurityMode, plaintext_len: usize) -> Result<usize> {
        let config = self.service.config();
        if mode != SecurityMode::OneTimePad {
            return Ok(config.default_key_size_bits);
        }

        let bits = plaintext_len
            .saturating_mul(8)
            .max(config.min_key_size_bits);
        if bits > config.max_key_size_bits {
            return Err(KmError::InvalidSize {
                bits,
                min: config.min_key_size_bits,
                max: config.max_key_size_bits,
            });
        }
        Ok(bits)
    }
}

fn required_key_id(mode: SecurityMode, key_id: Option<&str>) -> Result<KeyId> {
    match key_id {
        Some(raw) => parse_key_id(raw),
        None => Err(KmError::InvalidRequest(format!("mode {mode} needs a key_id"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use qkm_core::KeyState;
    use qkm_crypto::MasterKey;
    use qkm_store::MemoryStore;

    const ALICE: &str = "alice@example.com";
    const BOB: &str = "bob@example.com";

    fn mail(config: ServiceConfig) -> SecureMail<MemoryStore> {
        let service = KeyDeliveryService::new(
            Arc::new(MemoryStore::new()),
            MasterKey::from_bytes([5; 32]),
            ServiceConfig {
                simulator_seed: Some(3),
                ..config
            },
        );
        SecureMail::new(Arc::new(service))
    }

    #[tokio::test]
    async fn test_every_mode_roundtrips() {
        let mail = mail(ServiceConfig::default());
        for mode in SecurityMode::ALL {
            let sent = mail.encrypt(mode, b"hello", ALICE, BOB).await.unwrap();
            assert_eq!(sent.security_mode, mode.as_str());
            let opened = mail
                .decrypt(mode, &sent.ciphertext_b64, sent.key_id.as_deref(), BOB)
                .await
                .unwrap();
            assert_eq!(opened, b"hello", "mode {mode}");
        }
    }

    #[tokio::test]
    async fn test_pass_through_has_no_key() {
        let mail = mail(ServiceConfig::default());
        let sent = mail
            .encrypt(SecurityMode::PassThrough, b"plain", ALICE, BOB)
            .await
            .unwrap();
        assert_eq!(sent.key_id, None);
        assert_eq!(sent.nonce_size, 0);
        assert_eq!(sent.tag_size, 0);
        assert_eq!(mail.service().status().await.unwrap().sessions, 0);
    }

    #[tokio::test]
    async fn test_qkd_key_consumed_after_decrypt() {
        let mail = mail(ServiceConfig::default());
        let sent = mail
            .encrypt(SecurityMode::SimulatedQkd, b"once", ALICE, BOB)
            .await
            .unwrap();
        assert_eq!(sent.nonce_size, 12);
        assert_eq!(sent.tag_size, 16);

        let key_id = sent.key_id.as_deref();
        mail.decrypt(SecurityMode::SimulatedQkd, &sent.ciphertext_b64, key_id, BOB)
            .await
            .unwrap();
        let err = mail
            .decrypt(SecurityMode::SimulatedQkd, &sent.ciphertext_b64, key_id, BOB)
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidState { state: KeyState::Consumed, .. }));
    }

    #[tokio::test]
    async fn test_direct_key_is_reusable() {
        let mail = mail(ServiceConfig::default());
        let sent = mail
            .encrypt(SecurityMode::DirectSharedKey, b"again", ALICE, BOB)
            .await
            .unwrap();
        for _ in 0..2 {
            let opened = mail
                .decrypt(SecurityMode::DirectSharedKey, &sent.ciphertext_b64, sent.key_id.as_deref(), BOB)
                .await
                .unwrap();
            assert_eq!(opened, b"again");
        }
    }

    #[tokio::test]
    async fn test_tampered_message_keeps_key() {
        let mail = mail(ServiceConfig::default());
        let sent = mail
            .encrypt(SecurityMode::SimulatedQkd, b"integrity", ALICE, BOB)
            .await
            .unwrap();

        let mut raw = decode_b64("ct", &sent.ciphertext_b64).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let err = mail
            .decrypt(SecurityMode::SimulatedQkd, &encode_b64(&raw), sent.key_id.as_deref(), BOB)
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::CryptoFailure(_)));

        // The untouched message still opens.
        let opened = mail
            .decrypt(SecurityMode::SimulatedQkd, &sent.ciphertext_b64, sent.key_id.as_deref(), BOB)
            .await
            .unwrap();
        assert_eq!(opened, b"integrity");
    }

    #[tokio::test]
    async fn test_key_id_is_bound() {
        let mail = mail(ServiceConfig::default());
        let first = mail
            .encrypt(SecurityMode::DirectSharedKey, b"one", ALICE, BOB)
            .await
            .unwrap();
        let second = mail
            .encrypt(SecurityMode::DirectSharedKey, b"two", ALICE, BOB)
            .await
            .unwrap();

        let err = mail
            .decrypt(SecurityMode::DirectSharedKey, &first.ciphertext_b64, second.key_id.as_deref(), BOB)
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::CryptoFailure(_)));
    }

    #[tokio::test]
    async fn test_otp_sizes_key_to_message() {
        let mail = mail(ServiceConfig {
            max_key_size_bits: 256,
            ..ServiceConfig::default()
        });

        let sent = mail
            .encrypt(SecurityMode::OneTimePad, &[0x42; 20], ALICE, BOB)
            .await
            .unwrap();
        let raw = decode_b64("ct", &sent.ciphertext_b64).unwrap();
        assert_eq!(raw.len(), 20);

        let err = mail
            .encrypt(SecurityMode::OneTimePad, &[0x42; 33], ALICE, BOB)
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidSize { bits: 264, .. }));
    }

    #[tokio::test]
    async fn test_wrong_reader_forbidden() {
        let mail = mail(ServiceConfig::default());
        let sent = mail
            .encrypt(SecurityMode::SimulatedQkd, b"for bob", ALICE, BOB)
            .await
            .unwrap();
        let err = mail
            .decrypt(
                SecurityMode::SimulatedQkd,
                &sent.ciphertext_b64,
                sent.key_id.as_deref(),
                "eve@example.com",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_kem_registers_recipient_once() {
        let mail = mail(ServiceConfig::default());
        let first = mail
            .encrypt(SecurityMode::KeyEncapsulation, b"pq", ALICE, BOB)
            .await
            .unwrap();
        let published = mail.service().kem_public_key(BOB).await.unwrap();

        mail.encrypt(SecurityMode::KeyEncapsulation, b"pq2", ALICE, BOB)
            .await
            .unwrap();
        assert_eq!(mail.service().kem_public_key(BOB).await.unwrap(), published);

        // Only the recipient holds the private key.
        let err = mail
            .decrypt(SecurityMode::KeyEncapsulation, &first.ciphertext_b64, first.key_id.as_deref(), ALICE)
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_key_id_rejected() {
        let mail = mail(ServiceConfig::default());
        let err = mail
            .decrypt(SecurityMode::SimulatedQkd, "AAAA", None, BOB)
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidRequest(_)));

        let err = mail
            .decrypt(SecurityMode::PassThrough, "not base64!", None, BOB)
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::InvalidRequest(_)));
    }
}
