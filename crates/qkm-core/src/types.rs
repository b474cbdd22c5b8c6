//! Strong type definitions for the key manager.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Maximum length of an identity string, in bytes.
pub const MAX_IDENTITY_LEN: usize = 255;

/// A globally unique key identifier (one per key half).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Generate a fresh random key ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Links the two key halves minted by one simulated session.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingId(String);

impl PairingId {
    /// Generate a fresh random pairing ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PairingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairingId({})", self.0)
    }
}

impl fmt::Display for PairingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque party identity, e.g. a mailbox address.
///
/// Keys are bound to identities at creation time and every retrieval
/// re-checks the caller against the bound identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Parse and validate an identity.
    ///
    /// Identities must be non-empty mailbox-style addresses no longer
    /// than [`MAX_IDENTITY_LEN`] bytes.
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidIdentity("identity is empty".into()));
        }
        if trimmed.len() > MAX_IDENTITY_LEN {
            return Err(CoreError::InvalidIdentity(format!(
                "identity exceeds {} bytes",
                MAX_IDENTITY_LEN
            )));
        }
        if !trimmed.contains('@') {
            return Err(CoreError::InvalidIdentity(format!(
                "identity {trimmed:?} is not a mailbox address"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

/// Which half of a pairing a record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PartyRole {
    /// The requesting (sending) side.
    Initiator = 0,
    /// The receiving side.
    Responder = 1,
}

impl PartyRole {
    /// Convert to the storage discriminant.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from the storage discriminant.
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Initiator),
            1 => Some(Self::Responder),
            _ => None,
        }
    }

    /// The other half of the pairing.
    pub const fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    /// Stable lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

/// Lifecycle state of a key half.
///
/// States only move forward: `Stored -> Cached -> Served -> Consumed`.
/// Expiry is derived from `expires_at` and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyState {
    /// Freshly minted, not yet handed to anyone.
    Stored = 0,
    /// Staged for pickup by its bound party.
    Cached = 1,
    /// Delivered to its bound party at least once.
    Served = 2,
    /// Confirmed used; never servable again.
    Consumed = 3,
}

impl KeyState {
    /// All states in lifecycle order.
    pub const ALL: [KeyState; 4] = [
        KeyState::Stored,
        KeyState::Cached,
        KeyState::Served,
        KeyState::Consumed,
    ];

    /// Convert to the storage discriminant.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from the storage discriminant.
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stored),
            1 => Some(Self::Cached),
            2 => Some(Self::Served),
            3 => Some(Self::Consumed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_advance_to(self, next: KeyState) -> bool {
        next > self
    }

    /// Whether this state is terminal.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Consumed)
    }

    /// Stable uppercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stored => "STORED",
            Self::Cached => "CACHED",
            Self::Served => "SERVED",
            Self::Consumed => "CONSUMED",
        }
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
