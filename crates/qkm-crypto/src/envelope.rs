//! Encryption at rest under the process master key.
//!
//! Every piece of secret material that reaches storage (key halves, KEM
//! private keys) is wrapped in a [`SealedEnvelope`]: ChaCha20-Poly1305 under
//! the [`MasterKey`], with the record's identifiers bound as associated data
//! so an envelope cannot be moved onto a different record.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use qkm_core::KeyMaterial;

use crate::error::{CryptoError, Result};

/// Domain-separation context for passphrase-derived master keys.
const PASSPHRASE_CONTEXT: &str = "qkm 2024-06 master key from passphrase";

/// Format identifier for sealed envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeFormat {
    /// ChaCha20-Poly1305 with 256-bit key.
    ChaCha20Poly1305 = 1,
}

/// The process-wide 256-bit master key.
///
/// Loaded once at startup and held for the process lifetime. Never written
/// to storage.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("master key hex: {e}")))?;
        Ok(Self(bytes))
    }

    /// Derive a key from a passphrase with BLAKE3 key derivation.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(CryptoError::InvalidKey("empty passphrase".into()));
        }
        Ok(Self(blake3::derive_key(PASSPHRASE_CONTEXT, passphrase.as_bytes())))
    }

    /// Short public identifier for logs. Reveals nothing about the key.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::keyed_hash(&self.0, b"qkm fingerprint");
        hex::encode(&hash.as_bytes()[..8])
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))
    }

    /// Seal `plaintext` with `aad` bound.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedEnvelope> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        Ok(SealedEnvelope {
            format: EnvelopeFormat::ChaCha20Poly1305,
            nonce,
            ciphertext,
        })
    }

    /// Open an envelope sealed with the same `aad`.
    pub fn open(&self, envelope: &SealedEnvelope, aad: &[u8]) -> Result<Vec<u8>> {
        match envelope.format {
            EnvelopeFormat::ChaCha20Poly1305 => self
                .cipher()?
                .decrypt(
                    Nonce::from_slice(&envelope.nonce),
                    Payload {
                        msg: &envelope.ciphertext,
                        aad,
                    },
                )
                .map_err(|_| CryptoError::DecryptionError("envelope authentication failed".into())),
        }
    }

    /// Seal key material straight to storable bytes.
    pub fn seal_material(&self, material: &KeyMaterial, aad: &[u8]) -> Result<Vec<u8>> {
        self.seal(material.as_bytes(), aad)?.to_bytes()
    }

    /// Open storable bytes back into key material.
    pub fn open_material(&self, sealed: &[u8], aad: &[u8]) -> Result<KeyMaterial> {
        let envelope = SealedEnvelope::from_bytes(sealed)?;
        self.open(&envelope, aad).map(KeyMaterial::new)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey({})", self.fingerprint())
    }
}

/// A sealed secret as it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Encryption algorithm used.
    pub format: EnvelopeFormat,

    /// Nonce used for encryption (unique per seal).
    pub nonce: [u8; 12],

    /// The encrypted data (includes authentication tag).
    pub ciphertext: Vec<u8>,
}

impl SealedEnvelope {
    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CryptoError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| CryptoError::SerializationError(e.to_string()))
    }
}

/// Associated data binding a sealed key half to its record.
pub fn record_aad(key_id: &str, pairing_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.len() + pairing_id.len() + 1);
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(pairing_id.as_bytes());
    aad
}
