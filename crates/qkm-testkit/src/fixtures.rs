//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::path::Path;
use std::sync::{Arc, Once};

use qkm::{KeyDeliveryService, SecureMail, ServiceConfig};
use qkm_core::{Identity, ManualClock};
use qkm_crypto::MasterKey;
use qkm_store::{MemoryStore, SqliteStore, Store};

pub const ALICE: &str = "alice@example.com";
pub const BOB: &str = "bob@example.com";
pub const CAROL: &str = "carol@example.com";
pub const EVE: &str = "eve@example.com";

/// Start time of every fixture clock.
pub const EPOCH_MILLIS: i64 = 1_700_000_000_000;

/// Fixed master key shared by fixtures, so a reopened store stays readable.
pub fn master_key() -> MasterKey {
    MasterKey::from_bytes([0x42; 32])
}

/// Parse a known-good identity.
pub fn identity(s: &str) -> Identity {
    Identity::parse(s).expect("fixture identity")
}

/// A delivery service plus the handles tests poke at.
pub struct TestService<S: Store = MemoryStore> {
    pub service: Arc<KeyDeliveryService<S>>,
    pub mail: SecureMail<S>,
    pub clock: ManualClock,
}

impl TestService<MemoryStore> {
    /// In-memory service with default configuration.
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    /// In-memory service with `config`. The simulator seed defaults to 7.
    pub fn with_config(config: ServiceConfig) -> Self {
        Self::over(Arc::new(MemoryStore::new()), config)
    }
}

impl TestService<SqliteStore> {
    /// SQLite-backed service at `path`.
    pub fn sqlite(path: impl AsRef<Path>, config: ServiceConfig) -> Self {
        let store = SqliteStore::open(path).expect("open sqlite store");
        Self::over(Arc::new(store), config)
    }
}

impl<S: Store> TestService<S> {
    /// Service over an existing store.
    pub fn over(store: Arc<S>, config: ServiceConfig) -> Self {
        let clock = ManualClock::new(EPOCH_MILLIS);
        let config = ServiceConfig {
            simulator_seed: config.simulator_seed.or(Some(7)),
            ..config
        };
        let service = Arc::new(
            KeyDeliveryService::new(store, master_key(), config).with_clock(Arc::new(clock.clone())),
        );
        Self {
            mail: SecureMail::new(service.clone()),
            service,
            clock,
        }
    }

    /// Move the fixture clock forward.
    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(secs * 1000);
    }
}

impl Default for TestService<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

/// Distinct mailbox identities for multi-party tests.
pub fn multi_party_identities(count: usize) -> Vec<Identity> {
    (0..count)
        .map(|i| identity(&format!("user{i}@example.com")))
        .collect()
}

/// Install a test-writer subscriber once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .try_init();
    });
}
