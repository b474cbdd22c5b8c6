//! Persisted record shapes.
//!
//! A [`KeyRecord`] is one key half as it lives in storage: metadata in the
//! clear, key material only as a sealed envelope. Plaintext material is
//! carried by [`KeyMaterial`], which zeroizes on drop and never prints.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CoreError, Result};
use crate::types::{Identity, KeyId, KeyState, PairingId, PartyRole};

/// Algorithm label for keys minted by the channel simulator.
pub const SIMULATED_ALGORITHM: &str = "BB84-SIM";

/// Number of bytes needed to carry `bits` bits.
pub const fn bytes_for_bits(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Raw secret key bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the material is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that this material carries exactly `size_bits` bits.
    pub fn check_size(&self, size_bits: usize) -> Result<()> {
        let expected = bytes_for_bits(size_bits);
        if self.0.len() != expected {
            return Err(CoreError::MaterialSizeMismatch {
                expected,
                actual: self.0.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED; {}])", self.0.len())
    }
}

impl AsRef<[u8]> for KeyMaterial {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// One persisted key half.
///
/// `sealed_material` is written once at creation and never mutated; only
/// `state` and the timestamp fields change afterwards. All times are Unix
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Unique identifier of this half.
    pub key_id: KeyId,
    /// Links this half to its peer.
    pub pairing_id: PairingId,
    /// Which half this is.
    pub role: PartyRole,
    /// Key material sealed under the master key.
    pub sealed_material: Vec<u8>,
    /// Declared key size in bits.
    pub key_size_bits: usize,
    /// The initiating identity bound at creation.
    pub requester: Identity,
    /// The receiving identity bound at creation.
    pub recipient: Identity,
    /// Current lifecycle state.
    pub state: KeyState,
    pub created_at: i64,
    pub expires_at: i64,
    pub served_at: Option<i64>,
    pub consumed_at: Option<i64>,
    /// Protocol label, e.g. [`SIMULATED_ALGORITHM`].
    pub algorithm: String,
}

impl KeyRecord {
    /// The identity allowed to read this half.
    ///
    /// The initiator half belongs to the requester, the responder half to
    /// the recipient.
    pub fn bound_party(&self) -> &Identity {
        match self.role {
            PartyRole::Initiator => &self.requester,
            PartyRole::Responder => &self.recipient,
        }
    }

    /// Whether `caller` may read this half.
    pub fn is_bound_to(&self, caller: &Identity) -> bool {
        self.bound_party() == caller
    }

    /// Whether the record is past its expiry at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Metadata view without the sealed material.
    pub fn summary(&self) -> KeySummary {
        KeySummary {
            key_id: self.key_id.clone(),
            pairing_id: self.pairing_id.clone(),
            role: self.role,
            key_size_bits: self.key_size_bits,
            requester: self.requester.clone(),
            recipient: self.recipient.clone(),
            state: self.state,
            created_at: self.created_at,
            expires_at: self.expires_at,
            served_at: self.served_at,
            consumed_at: self.consumed_at,
            algorithm: self.algorithm.clone(),
        }
    }
}

/// Key metadata safe to return to callers and to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySummary {
    pub key_id: KeyId,
    pub pairing_id: PairingId,
    pub role: PartyRole,
    pub key_size_bits: usize,
    pub requester: Identity,
    pub recipient: Identity,
    pub state: KeyState,
    pub created_at: i64,
    pub expires_at: i64,
    pub served_at: Option<i64>,
    pub consumed_at: Option<i64>,
    pub algorithm: String,
}

/// A long-lived key-encapsulation keypair for one identity.
///
/// The private half is stored sealed under the master key, like key
/// material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KemRecord {
    /// Owning identity.
    pub identity: Identity,
    /// KEM algorithm label.
    pub algorithm: String,
    /// Encoded public (encapsulation) key.
    pub public_key: Vec<u8>,
    /// Sealed encoded private (decapsulation) key.
    pub sealed_private_key: Vec<u8>,
    pub created_at: i64,
}

/// Record counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub stored: u64,
    pub cached: u64,
    pub served: u64,
    pub consumed: u64,
    /// Records past expiry but not yet purged (any state).
    pub expired: u64,
}

impl StateCounts {
    /// Add one unexpired record in `state`.
    pub fn record(&mut self, state: KeyState) {
        match state {
            KeyState::Stored => self.stored += 1,
            KeyState::Cached => self.cached += 1,
            KeyState::Served => self.served += 1,
            KeyState::Consumed => self.consumed += 1,
        }
    }

    /// Total records counted.
    pub fn total(&self) -> u64 {
        self.stored + self.cached + self.served + self.consumed + self.expired
    }
}
