//! AES-256-GCM protect/unprotect.
//!
//! Wire layout is `nonce (12) || ciphertext || tag (16)`, with a fresh
//! random nonce per call.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use crate::error::{CryptoError, Result};
use crate::kdf::DerivedKey;

/// GCM nonce length in bytes.
pub const NONCE_SIZE: usize = 12;

/// GCM tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// Ciphertext split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protected {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl Protected {
    /// Serialize as `nonce || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len() + TAG_SIZE);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse `nonce || ciphertext || tag`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Malformed(format!(
                "{} bytes is shorter than nonce and tag",
                bytes.len()
            )));
        }

        let (nonce, rest) = bytes.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

        let mut out = Self {
            nonce: [0u8; NONCE_SIZE],
            ciphertext: ciphertext.to_vec(),
            tag: [0u8; TAG_SIZE],
        };
        out.nonce.copy_from_slice(nonce);
        out.tag.copy_from_slice(tag);
        Ok(out)
    }
}

fn cipher(key: &DerivedKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encrypt `plaintext` under `key` with `aad` bound.
pub fn protect(plaintext: &[u8], key: &DerivedKey, aad: &[u8]) -> Result<Protected> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut sealed = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let tag_start = sealed.len() - TAG_SIZE;
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);

    Ok(Protected {
        nonce,
        ciphertext: sealed,
        tag,
    })
}

/// Decrypt and verify. Fails closed on any tag mismatch.
pub fn unprotect(protected: &Protected, key: &DerivedKey, aad: &[u8]) -> Result<Vec<u8>> {
    let mut joined = Vec::with_capacity(protected.ciphertext.len() + TAG_SIZE);
    joined.extend_from_slice(&protected.ciphertext);
    joined.extend_from_slice(&protected.tag);

    cipher(key)?
        .decrypt(
            Nonce::from_slice(&protected.nonce),
            Payload { msg: &joined, aad },
        )
        .map_err(|_| CryptoError::DecryptionError("authentication tag mismatch".into()))
}
