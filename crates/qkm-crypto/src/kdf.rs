//! Key derivation from raw shared material.
//!
//! HKDF-SHA256 with a per-mode context string, so the same raw material fed
//! to two different modes never yields the same working key.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// Length of derived working keys.
pub const DERIVED_KEY_SIZE: usize = 32;

/// Purpose a derived key is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivationContext {
    /// AES-GCM under a delivered key that stays reusable until expiry.
    DirectSharedKey,
    /// AES-GCM under a single-use simulated QKD key.
    SimulatedQkd,
    /// AES-GCM under an ML-KEM shared secret.
    KeyEncapsulation,
}

impl DerivationContext {
    /// HKDF info string.
    pub const fn info(self) -> &'static [u8] {
        match self {
            Self::DirectSharedKey => b"qkm/v1/direct-aead",
            Self::SimulatedQkd => b"qkm/v1/qkd-aead",
            Self::KeyEncapsulation => b"qkm/v1/kem-aead",
        }
    }
}

/// A 256-bit working key produced by [`derive_key`].
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; DERIVED_KEY_SIZE]);

impl DerivedKey {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// Derive a working key from raw material for `context`.
///
/// Fails on empty input material.
pub fn derive_key(raw: &[u8], context: DerivationContext) -> Result<DerivedKey> {
    if raw.is_empty() {
        return Err(CryptoError::KeyDerivationError("empty input key material".into()));
    }

    let hk = Hkdf::<Sha256>::new(None, raw);
    let mut okm = [0u8; DERIVED_KEY_SIZE];
    hk.expand(context.info(), &mut okm)
        .map_err(|e| CryptoError::KeyDerivationError(e.to_string()))?;
    Ok(DerivedKey(okm))
}
