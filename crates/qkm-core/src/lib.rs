//! # QKM Core
//!
//! Pure primitives for the QKM key manager: identities, key records,
//! lifecycle states, and the simulated quantum channel that mints key pairs.
//!
//! This crate contains no storage, no networking and no encryption. It is
//! pure computation over key metadata plus a seeded random source.
//!
//! ## Key Types
//!
//! - [`KeyRecord`] - One persisted key half with its binding and state
//! - [`KeyState`] - Forward-only lifecycle: Stored, Cached, Served, Consumed
//! - [`Identity`] - Validated mailbox-style party identity
//! - [`ChannelSimulator`] - BB84-style agreement producing identical key pairs
//! - [`KeyMaterial`] - Secret bytes that zeroize on drop and never print
//!
//! ## Simulation
//!
//! The simulator is a stand-in for real quantum hardware. It reproduces the
//! observable behavior (noise, sifting, correction, agreement failure) but
//! its output is only as secret as the process RNG. See [`simulator`].

pub mod clock;
pub mod error;
pub mod reconcile;
pub mod record;
pub mod simulator;
pub mod types;

pub use clock::{now_millis, Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use record::{
    bytes_for_bits, KemRecord, KeyMaterial, KeyRecord, KeySummary, StateCounts, SIMULATED_ALGORITHM,
};
pub use simulator::{ChannelSimulator, ChannelStats, SimulatedSession, SimulatorConfig};
pub use types::{Identity, KeyId, KeyState, PairingId, PartyRole, MAX_IDENTITY_LEN};
