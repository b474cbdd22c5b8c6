//! Security modes and their protect/unprotect schemes.
//!
//! [`SecurityMode`] is the closed set of modes callers can select. Each mode
//! resolves to a [`Scheme`] through [`SecurityMode::scheme`]; call sites go
//! through the trait and never match on the mode themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::aead::{self, Protected, NONCE_SIZE, TAG_SIZE};
use crate::error::{CryptoError, Result};
use crate::kdf::{derive_key, DerivationContext};
use crate::kem::{self, KemPrivateKey, KemPublicKey, CIPHERTEXT_SIZE};
use crate::otp;

/// Encryption mode selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No encryption.
    PassThrough,
    /// AES-256-GCM under a delivered key, reusable until expiry.
    DirectSharedKey,
    /// AES-256-GCM under a single-use simulated QKD key.
    SimulatedQkd,
    /// AES-256-GCM under an ML-KEM-768 shared secret.
    KeyEncapsulation,
    /// XOR against a single-use delivered key.
    OneTimePad,
}

impl SecurityMode {
    pub const ALL: [SecurityMode; 5] = [
        SecurityMode::PassThrough,
        SecurityMode::DirectSharedKey,
        SecurityMode::SimulatedQkd,
        SecurityMode::KeyEncapsulation,
        SecurityMode::OneTimePad,
    ];

    /// Stable short tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PassThrough => "regular",
            Self::DirectSharedKey => "aes",
            Self::SimulatedQkd => "qkd",
            Self::KeyEncapsulation => "pqc",
            Self::OneTimePad => "otp",
        }
    }

    /// The scheme implementing this mode.
    pub fn scheme(self) -> &'static dyn Scheme {
        match self {
            Self::PassThrough => &PassThroughScheme,
            Self::DirectSharedKey => &DIRECT,
            Self::SimulatedQkd => &QKD,
            Self::KeyEncapsulation => &KemScheme,
            Self::OneTimePad => &OneTimePadScheme,
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" | "pass-through" | "passthrough" | "none" => Ok(Self::PassThrough),
            "aes" | "direct" | "direct-shared-key" => Ok(Self::DirectSharedKey),
            "qkd" | "simulated-qkd" => Ok(Self::SimulatedQkd),
            "pqc" | "kem" | "qkd_pqc" | "key-encapsulation" => Ok(Self::KeyEncapsulation),
            "otp" | "qs_otp" | "one-time-pad" => Ok(Self::OneTimePad),
            other => Err(CryptoError::UnknownMode(other.to_string())),
        }
    }
}

/// Key input handed to a scheme.
#[derive(Clone, Copy)]
pub enum ModeKey<'a> {
    /// Mode needs no key.
    None,
    /// Raw shared key bytes delivered by the key manager.
    Shared(&'a [u8]),
    /// Recipient's KEM public key, for protecting.
    KemPublic(&'a KemPublicKey),
    /// Recipient's KEM private key, for unprotecting.
    KemPrivate(&'a KemPrivateKey),
}

impl ModeKey<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Self::None => "no key",
            Self::Shared(_) => "shared key",
            Self::KemPublic(_) => "KEM public key",
            Self::KemPrivate(_) => "KEM private key",
        }
    }
}

/// What a mode needs from the key manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Nothing.
    None,
    /// A delivered pairing key.
    Delivered {
        /// Whether the key is consumed once the recipient has decrypted.
        single_use: bool,
    },
    /// The recipient's KEM keypair.
    KemDirectory,
}

/// The common protect/unprotect contract.
pub trait Scheme: Send + Sync {
    /// The mode this scheme implements.
    fn mode(&self) -> SecurityMode;

    /// Algorithm label reported with ciphertext.
    fn algorithm(&self) -> &'static str;

    /// Where the key comes from.
    fn key_source(&self) -> KeySource;

    /// Nonce bytes in the output, 0 if none.
    fn nonce_size(&self) -> usize {
        0
    }

    /// Tag bytes in the output, 0 if none.
    fn tag_size(&self) -> usize {
        0
    }

    /// Encrypt `plaintext`, binding `aad` where the mode supports it.
    fn protect(&self, plaintext: &[u8], key: ModeKey<'_>, aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt. Never returns partial plaintext on failure.
    fn unprotect(&self, ciphertext: &[u8], key: ModeKey<'_>, aad: &[u8]) -> Result<Vec<u8>>;
}

fn wrong_key(mode: SecurityMode, key: &ModeKey<'_>) -> CryptoError {
    CryptoError::InvalidKey(format!("mode {} cannot use {}", mode, key.kind()))
}

struct PassThroughScheme;

impl Scheme for PassThroughScheme {
    fn mode(&self) -> SecurityMode {
        SecurityMode::PassThrough
    }

    fn algorithm(&self) -> &'static str {
        "NONE"
    }

    fn key_source(&self) -> KeySource {
        KeySource::None
    }

    fn protect(&self, plaintext: &[u8], _key: ModeKey<'_>, _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn unprotect(&self, ciphertext: &[u8], _key: ModeKey<'_>, _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// HKDF + AES-256-GCM over a delivered key.
struct SharedKeyAead {
    mode: SecurityMode,
    context: DerivationContext,
    algorithm: &'static str,
    single_use: bool,
}

const DIRECT: SharedKeyAead = SharedKeyAead {
    mode: SecurityMode::DirectSharedKey,
    context: DerivationContext::DirectSharedKey,
    algorithm: "AES-256-GCM",
    single_use: false,
};

const QKD: SharedKeyAead = SharedKeyAead {
    mode: SecurityMode::SimulatedQkd,
    context: DerivationContext::SimulatedQkd,
    algorithm: "QKD+HKDF-SHA256+AES-256-GCM",
    single_use: true,
};

impl Scheme for SharedKeyAead {
    fn mode(&self) -> SecurityMode {
        self.mode
    }

    fn algorithm(&self) -> &'static str {
        self.algorithm
    }

    fn key_source(&self) -> KeySource {
        KeySource::Delivered {
            single_use: self.single_use,
        }
    }

    fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    fn tag_size(&self) -> usize {
        TAG_SIZE
    }

    fn protect(&self, plaintext: &[u8], key: ModeKey<'_>, aad: &[u8]) -> Result<Vec<u8>> {
        let ModeKey::Shared(raw) = key else {
            return Err(wrong_key(self.mode, &key));
        };
        let derived = derive_key(raw, self.context)?;
        Ok(aead::protect(plaintext, &derived, aad)?.to_bytes())
    }

    fn unprotect(&self, ciphertext: &[u8], key: ModeKey<'_>, aad: &[u8]) -> Result<Vec<u8>> {
        let ModeKey::Shared(raw) = key else {
            return Err(wrong_key(self.mode, &key));
        };
        let derived = derive_key(raw, self.context)?;
        aead::unprotect(&Protected::from_bytes(ciphertext)?, &derived, aad)
    }
}

/// ML-KEM-768 + HKDF + AES-256-GCM.
///
/// Output is `encapsulated blob || nonce || ciphertext || tag`.
struct KemScheme;

impl Scheme for KemScheme {
    fn mode(&self) -> SecurityMode {
        SecurityMode::KeyEncapsulation
    }

    fn algorithm(&self) -> &'static str {
        "ML-KEM-768+HKDF-SHA256+AES-256-GCM"
    }

    fn key_source(&self) -> KeySource {
        KeySource::KemDirectory
    }

    fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    fn tag_size(&self) -> usize {
        TAG_SIZE
    }

    fn protect(&self, plaintext: &[u8], key: ModeKey<'_>, aad: &[u8]) -> Result<Vec<u8>> {
        let ModeKey::KemPublic(public) = key else {
            return Err(wrong_key(self.mode(), &key));
        };

        let (secret, blob) = kem::encapsulate(public)?;
        let derived = derive_key(secret.as_bytes(), DerivationContext::KeyEncapsulation)?;
        let sealed = aead::protect(plaintext, &derived, aad)?;

        let mut out = blob;
        out.extend_from_slice(&sealed.to_bytes());
        Ok(out)
    }

    fn unprotect(&self, ciphertext: &[u8], key: ModeKey<'_>, aad: &[u8]) -> Result<Vec<u8>> {
        let ModeKey::KemPrivate(private) = key else {
            return Err(wrong_key(self.mode(), &key));
        };
        if ciphertext.len() < CIPHERTEXT_SIZE {
            return Err(CryptoError::Malformed(format!(
                "{} bytes is shorter than the encapsulated key",
                ciphertext.len()
            )));
        }

        let (blob, rest) = ciphertext.split_at(CIPHERTEXT_SIZE);
        let secret = kem::decapsulate(blob, private)?;
        let derived = derive_key(secret.as_bytes(), DerivationContext::KeyEncapsulation)?;
        aead::unprotect(&Protected::from_bytes(rest)?, &derived, aad)
    }
}

struct OneTimePadScheme;

impl Scheme for OneTimePadScheme {
    fn mode(&self) -> SecurityMode {
        SecurityMode::OneTimePad
    }

    fn algorithm(&self) -> &'static str {
        "OTP-XOR"
    }

    fn key_source(&self) -> KeySource {
        KeySource::Delivered { single_use: true }
    }

    fn protect(&self, plaintext: &[u8], key: ModeKey<'_>, _aad: &[u8]) -> Result<Vec<u8>> {
        let ModeKey::Shared(raw) = key else {
            return Err(wrong_key(self.mode(), &key));
        };
        otp::xor(plaintext, raw)
    }

    fn unprotect(&self, ciphertext: &[u8], key: ModeKey<'_>, _aad: &[u8]) -> Result<Vec<u8>> {
        let ModeKey::Shared(raw) = key else {
            return Err(wrong_key(self.mode(), &key));
        };
        otp::xor(ciphertext, raw)
    }
}
