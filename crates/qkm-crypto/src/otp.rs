//! One-time pad.

use crate::error::{CryptoError, Result};

/// XOR `data` against the leading bytes of `key`.
///
/// Encryption and decryption are the same operation. Fails if the key is
/// shorter than the data.
pub fn xor(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if data.len() > key.len() {
        return Err(CryptoError::LengthMismatch {
            needed: data.len(),
            available: key.len(),
        });
    }
    Ok(data.iter().zip(key).map(|(d, k)| d ^ k).collect())
}
