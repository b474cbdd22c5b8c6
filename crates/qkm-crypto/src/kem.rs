//! ML-KEM-768 key encapsulation.
//!
//! Decapsulation with the wrong private key does not error: ML-KEM uses
//! implicit rejection and returns an unrelated secret. The mismatch only
//! surfaces downstream as an AEAD tag failure.

use std::fmt;

use ml_kem::kem::{Decapsulate, DecapsulationKey, Encapsulate, EncapsulationKey};
use ml_kem::{Ciphertext, EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, Result};

/// Algorithm label stored alongside KEM keys.
pub const KEM_ALGORITHM: &str = "ML-KEM-768";

/// Encoded encapsulation key size.
pub const PUBLIC_KEY_SIZE: usize = 1184;

/// Encoded decapsulation key size.
pub const PRIVATE_KEY_SIZE: usize = 2400;

/// Encapsulated blob size.
pub const CIPHERTEXT_SIZE: usize = 1088;

/// Shared secret size.
pub const SHARED_SECRET_SIZE: usize = 32;

/// An encoded ML-KEM-768 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct KemPublicKey(Vec<u8>);

impl KemPublicKey {
    /// Wrap encoded bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "public key is {} bytes, expected {}",
                bytes.len(),
                PUBLIC_KEY_SIZE
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn to_key(&self) -> Result<EncapsulationKey<MlKem768Params>> {
        let arr: &[u8; PUBLIC_KEY_SIZE] = self
            .0
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key length".into()))?;
        Ok(EncapsulationKey::<MlKem768Params>::from_bytes(arr.into()))
    }
}

impl fmt::Debug for KemPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KemPublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

/// An encoded ML-KEM-768 private key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KemPrivateKey(Vec<u8>);

impl KemPrivateKey {
    /// Wrap encoded bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "private key is {} bytes, expected {}",
                bytes.len(),
                PRIVATE_KEY_SIZE
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn to_key(&self) -> Result<DecapsulationKey<MlKem768Params>> {
        let arr: Zeroizing<[u8; PRIVATE_KEY_SIZE]> = Zeroizing::new(
            self.0
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("private key length".into()))?,
        );
        Ok(DecapsulationKey::<MlKem768Params>::from_bytes((&*arr).into()))
    }
}

impl fmt::Debug for KemPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KemPrivateKey([REDACTED])")
    }
}

/// A freshly generated keypair.
#[derive(Debug, Clone)]
pub struct KemKeyPair {
    pub public: KemPublicKey,
    pub private: KemPrivateKey,
}

impl KemKeyPair {
    /// Generate a new keypair from OS randomness.
    pub fn generate() -> Self {
        let (dk, ek) = MlKem768::generate(&mut OsRng);
        Self {
            public: KemPublicKey(ek.as_bytes().as_slice().to_vec()),
            private: KemPrivateKey(dk.as_bytes().as_slice().to_vec()),
        }
    }
}

/// A 32-byte KEM shared secret.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Encapsulate against `public`, returning the secret and the blob to send.
pub fn encapsulate(public: &KemPublicKey) -> Result<(SharedSecret, Vec<u8>)> {
    let ek = public.to_key()?;
    let (ct, ss) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| CryptoError::KemError("encapsulation failed".into()))?;

    let mut secret = [0u8; SHARED_SECRET_SIZE];
    secret.copy_from_slice(ss.as_slice());
    Ok((SharedSecret(secret), ct.as_slice().to_vec()))
}

/// Recover the shared secret from `blob` with `private`.
pub fn decapsulate(blob: &[u8], private: &KemPrivateKey) -> Result<SharedSecret> {
    if blob.len() != CIPHERTEXT_SIZE {
        return Err(CryptoError::Malformed(format!(
            "encapsulated blob is {} bytes, expected {}",
            blob.len(),
            CIPHERTEXT_SIZE
        )));
    }

    let ct = Ciphertext::<MlKem768>::try_from(blob)
        .map_err(|_| CryptoError::Malformed("invalid ML-KEM ciphertext size".into()))?;
    let ss = private
        .to_key()?
        .decapsulate(&ct)
        .map_err(|_| CryptoError::KemError("decapsulation failed".into()))?;

    let mut secret = [0u8; SHARED_SECRET_SIZE];
    secret.copy_from_slice(ss.as_slice());
    Ok(SharedSecret(secret))
}
