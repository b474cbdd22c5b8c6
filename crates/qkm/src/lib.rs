//! # QKM
//!
//! Key management for quantum-secured mail: simulated QKD key agreement,
//! a persistent key lifecycle, a delivery protocol, and hybrid message
//! encryption.
//!
//! ## Overview
//!
//! - **Channel simulator**: produces identical key halves for two parties
//!   over a simulated noisy quantum channel
//! - **Key lifecycle**: both halves of a pairing are sealed under a master
//!   key and move forward through `STORED → CACHED → SERVED → CONSUMED`
//! - **Delivery service**: request, retrieve, consume, status and cleanup,
//!   with authorization derived from the stored identities
//! - **Secure mail**: encrypt and decrypt under one of five security modes
//!
//! ## Key Concepts
//!
//! - **Pairing**: two records generated together with identical material.
//!   The initiator half belongs to the requester, the responder half to the
//!   recipient.
//! - **Key id translation**: the recipient may present the initiator's key
//!   id; the service maps it to the responder half.
//! - **Single use**: `qkd` and `otp` keys are consumed after a successful
//!   decrypt and can never be served again.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use qkm::{KeyDeliveryService, SecureMail, SecurityMode, ServiceConfig};
//! use qkm::crypto::MasterKey;
//! use qkm::store::SqliteStore;
//!
//! async fn example() {
//!     let store = Arc::new(SqliteStore::open("keys.db").unwrap());
//!     let master = MasterKey::from_passphrase("correct horse battery staple").unwrap();
//!     let service = Arc::new(KeyDeliveryService::new(store, master, ServiceConfig::default()));
//!
//!     let mail = SecureMail::new(service.clone());
//!     let sent = mail
//!         .encrypt(SecurityMode::SimulatedQkd, b"hello", "alice@example.com", "bob@example.com")
//!         .await
//!         .unwrap();
//!
//!     let plaintext = mail
//!         .decrypt(
//!             SecurityMode::SimulatedQkd,
//!             &sent.ciphertext_b64,
//!             sent.key_id.as_deref(),
//!             "bob@example.com",
//!         )
//!         .await
//!         .unwrap();
//!     assert_eq!(plaintext, b"hello");
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `qkm::core` - identifiers, records, the channel simulator
//! - `qkm::store` - storage abstraction, SQLite and in-memory backends
//! - `qkm::crypto` - envelope encryption, KDF, AEAD, ML-KEM, security modes

pub mod config;
pub mod delivery;
pub mod error;
pub mod hybrid;
pub mod lifecycle;
pub mod protocol;

// Re-export component crates
pub use qkm_core as core;
pub use qkm_crypto as crypto;
pub use qkm_store as store;

// Re-export main types for convenience
pub use config::{master_key_from_env, ConfigError, ServiceConfig};
pub use delivery::{spawn_purge_task, KeyDeliveryService};
pub use error::{ErrorKind, KmError, Result};
pub use hybrid::{EncryptResponse, SecureMail};
pub use lifecycle::{AllocatedPair, FetchedKey, KeyLifecycle};
pub use protocol::{
    CleanupResponse, ConsumeKey, ConsumeResponse, ErrorResponse, KemKeyResponse, KeyDelivery,
    ListKeys, ListKeysResponse, RequestKey, RetrieveKey, StatusResponse,
};

// Re-export commonly used component types
pub use qkm_core::{Identity, KeyId, KeyState, PairingId, PartyRole};
pub use qkm_crypto::SecurityMode;
