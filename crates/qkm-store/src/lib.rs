//! # QKM Store
//!
//! Storage abstraction for the QKM key manager. Provides a trait-based
//! interface for key record persistence with SQLite and in-memory
//! implementations.
//!
//! ## Overview
//!
//! The store abstracts key records behind the [`Store`] trait so the
//! lifecycle layer is storage-agnostic. The primary implementation is
//! [`SqliteStore`], with [`MemoryStore`] for testing.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`TransitionResult`] - Outcome of a compare-and-set state change
//!
//! ## Usage
//!
//! ```rust,no_run
//! use qkm_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("keys.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     let counts = store.count_by_state(0).await.unwrap();
//!     assert_eq!(counts.total(), 0);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Sealed at rest**: The store only ever sees sealed key material
//! - **Forward-only states**: [`Store::advance`] refuses backward moves
//! - **Atomic pairs**: Both halves of a pairing land together or not at all

#[cfg(test)]
mod conformance;
pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{Store, TransitionResult};
