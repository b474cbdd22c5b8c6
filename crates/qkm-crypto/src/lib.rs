//! # QKM Crypto
//!
//! Cryptographic building blocks for the QKM key manager.
//!
//! ## Overview
//!
//! Two distinct jobs live here:
//!
//! 1. **Encryption at rest**: [`MasterKey`] seals key material and KEM
//!    private keys into CBOR [`SealedEnvelope`]s before they reach storage.
//! 2. **Message protection**: the [`SecurityMode`] schemes turn raw key
//!    material into authenticated ciphertext and back.
//!
//! Nothing in this crate touches persistence or authorization.
//!
//! ## Security Modes
//!
//! | Mode | Key | Construction |
//! |------|-----|--------------|
//! | `regular` | none | pass-through |
//! | `aes` | delivered, reusable | HKDF-SHA256 + AES-256-GCM |
//! | `qkd` | delivered, single use | HKDF-SHA256 + AES-256-GCM |
//! | `pqc` | recipient KEM keypair | ML-KEM-768 + HKDF-SHA256 + AES-256-GCM |
//! | `otp` | delivered, single use | XOR |
//!
//! Each mode derives with its own HKDF context, so one raw key used under
//! two modes gives two unrelated working keys.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use qkm_crypto::{ModeKey, SecurityMode};
//!
//! let raw_key = [7u8; 32];
//! let scheme = SecurityMode::SimulatedQkd.scheme();
//! let ct = scheme.protect(b"hello", ModeKey::Shared(&raw_key), b"key-id").unwrap();
//! let pt = scheme.unprotect(&ct, ModeKey::Shared(&raw_key), b"key-id").unwrap();
//! assert_eq!(pt, b"hello");
//! ```

pub mod aead;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod kem;
pub mod modes;
pub mod otp;

pub use aead::{protect, unprotect, Protected, NONCE_SIZE, TAG_SIZE};
pub use envelope::{record_aad, EnvelopeFormat, MasterKey, SealedEnvelope};
pub use error::{CryptoError, Result};
pub use kdf::{derive_key, DerivationContext, DerivedKey};
pub use kem::{KemKeyPair, KemPrivateKey, KemPublicKey, SharedSecret, KEM_ALGORITHM};
pub use modes::{KeySource, ModeKey, Scheme, SecurityMode};
