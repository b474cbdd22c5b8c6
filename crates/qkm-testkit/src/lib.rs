//! # QKM Testkit
//!
//! Testing utilities for QKM.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a ready-made delivery service with a fixed master key,
//!   a seeded simulator and a manual clock
//! - **Generators**: proptest strategies for identities, key sizes,
//!   security modes and message payloads
//! - **Faults**: a store wrapper that fails or delays calls on demand
//!
//! ## Test Fixtures
//!
//! ```rust
//! use qkm_testkit::fixtures::{TestService, ALICE, BOB};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let fixture = TestService::new();
//! let sent = fixture
//!     .mail
//!     .encrypt(qkm::SecurityMode::SimulatedQkd, b"hi", ALICE, BOB)
//!     .await
//!     .unwrap();
//! assert!(sent.key_id.is_some());
//! # });
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use qkm_testkit::generators::MailParams;
//!
//! proptest! {
//!     #[test]
//!     fn sender_and_recipient_differ(params: MailParams) {
//!         prop_assert_ne!(params.requester, params.recipient);
//!     }
//! }
//! ```

pub mod faults;
pub mod fixtures;
pub mod generators;

pub use faults::FaultyStore;
pub use fixtures::{init_tracing, multi_party_identities, TestService};
pub use generators::{mail_params, MailParams};
