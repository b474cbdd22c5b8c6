//! The key lifecycle: allocation, retrieval, consumption and expiry.
//!
//! [`KeyLifecycle`] owns the master key and the channel simulator and is the
//! only component that sees plaintext key material. Every state change goes
//! through a single compare-and-set on the store, so concurrent callers on
//! one key id are linearized by the store, not by this type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qkm_core::{
    ChannelSimulator, ChannelStats, Clock, Identity, KemRecord, KeyId, KeyMaterial, KeyRecord,
    KeyState, KeySummary, PairingId, PartyRole, StateCounts, SystemClock, SIMULATED_ALGORITHM,
};
use qkm_crypto::{
    record_aad, KemKeyPair, KemPrivateKey, KemPublicKey, MasterKey, SealedEnvelope, KEM_ALGORITHM,
};
use qkm_store::{Store, TransitionResult};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{KmError, Result};

/// Both halves of a freshly allocated pairing.
#[derive(Debug, Clone)]
pub struct AllocatedPair {
    pub initiator: KeyRecord,
    pub responder: KeyRecord,
    pub stats: ChannelStats,
}

/// A record together with its opened key material.
///
/// The material lives only as long as this value.
#[derive(Debug)]
pub struct FetchedKey {
    pub record: KeyRecord,
    pub material: KeyMaterial,
}

/// Lifecycle operations over a [`Store`].
pub struct KeyLifecycle<S: Store> {
    store: Arc<S>,
    master: MasterKey,
    simulator: Mutex<ChannelSimulator>,
    clock: Arc<dyn Clock>,
    error_rate: f64,
    sessions: AtomicU64,
}

impl<S: Store> KeyLifecycle<S> {
    /// Create a lifecycle over `store` using the system clock.
    pub fn new(store: Arc<S>, master: MasterKey, simulator: ChannelSimulator, error_rate: f64) -> Self {
        Self {
            store,
            master,
            simulator: Mutex::new(simulator),
            clock: Arc::new(SystemClock),
            error_rate,
            sessions: AtomicU64::new(0),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    /// Number of simulated sessions run so far.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Allocation
    // ─────────────────────────────────────────────────────────────────────

    /// Run the simulator and persist both halves of a new pairing.
    ///
    /// Both records are written in one store transaction in state STORED.
    pub async fn allocate_pair(
        &self,
        requester: &Identity,
        recipient: &Identity,
        key_size_bits: usize,
        ttl: Duration,
    ) -> Result<AllocatedPair> {
        let session = {
            let mut simulator = self
                .simulator
                .lock()
                .map_err(|_| KmError::Internal("simulator lock poisoned".into()))?;
            simulator.generate_pair(key_size_bits, self.error_rate)?
        };
        self.sessions.fetch_add(1, Ordering::Relaxed);

        if session.initiator_key != session.responder_key {
            return Err(KmError::AgreementFailure("simulated halves disagree".into()));
        }

        let pairing_id = PairingId::generate();
        let now = self.now();
        let expires_at = now.saturating_add(ttl_millis(ttl));

        let seal = |role: PartyRole, material: &KeyMaterial| -> Result<KeyRecord> {
            let key_id = KeyId::generate();
            let aad = record_aad(key_id.as_str(), pairing_id.as_str());
            Ok(KeyRecord {
                sealed_material: self.master.seal_material(material, &aad)?,
                key_id,
                pairing_id: pairing_id.clone(),
                role,
                key_size_bits,
                requester: requester.clone(),
                recipient: recipient.clone(),
                state: KeyState::Stored,
                created_at: now,
                expires_at,
                served_at: None,
                consumed_at: None,
                algorithm: SIMULATED_ALGORITHM.to_string(),
            })
        };

        let initiator = seal(PartyRole::Initiator, &session.initiator_key)?;
        let responder = seal(PartyRole::Responder, &session.responder_key)?;
        self.store.insert_pair(&initiator, &responder).await?;

        info!(
            pairing_id = %pairing_id,
            requester = %requester,
            recipient = %recipient,
            key_size_bits,
            qber = session.stats.qber(),
            rounds = session.stats.rounds,
            "allocated key pairing"
        );

        Ok(AllocatedPair {
            initiator,
            responder,
            stats: session.stats,
        })
    }

    /// Oldest unexpired STORED pairing for this identity pair and size.
    ///
    /// Spares expiring later than `ttl` from now are skipped, so a pooled
    /// key never outlives the lifetime the caller asked for.
    pub async fn find_spare(
        &self,
        requester: &Identity,
        recipient: &Identity,
        key_size_bits: usize,
        ttl: Duration,
    ) -> Result<Option<(KeyRecord, KeyRecord)>> {
        let now = self.now();
        let latest_expiry = now.saturating_add(ttl_millis(ttl));
        let Some(initiator) = self
            .store
            .find_spare(requester, recipient, key_size_bits, now, latest_expiry)
            .await?
        else {
            return Ok(None);
        };

        match self.store.get_peer(&initiator.key_id).await? {
            Some(responder) => Ok(Some((initiator, responder))),
            None => {
                warn!(key_id = %initiator.key_id, "spare key has no peer half");
                Ok(None)
            }
        }
    }

    /// Claim a STORED initiator half for its requester.
    ///
    /// Returns `None` if another caller claimed it first. Unlike
    /// [`fetch`](Self::fetch), a claim never succeeds twice.
    pub async fn claim(&self, key_id: &KeyId, caller: &Identity) -> Result<Option<FetchedKey>> {
        self.checked(key_id, caller).await?;

        let now = self.now();
        match self
            .store
            .advance(key_id, &[KeyState::Stored], KeyState::Served, now)
            .await?
        {
            TransitionResult::Applied(record) => {
                debug!(key_id = %key_id, state = %record.state, "claimed key");
                let material = self.open(&record)?;
                Ok(Some(FetchedKey { record, material }))
            }
            TransitionResult::Rejected { .. } | TransitionResult::Missing => Ok(None),
        }
    }

    /// Move the responder half of a delivered pairing to CACHED.
    pub async fn stage_for_pickup(&self, key_id: &KeyId) -> Result<()> {
        let outcome = self
            .store
            .advance(key_id, &[KeyState::Stored], KeyState::Cached, self.now())
            .await?;
        if let TransitionResult::Rejected { current } = outcome {
            debug!(key_id = %key_id, state = %current, "peer half already past STORED");
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Retrieval
    // ─────────────────────────────────────────────────────────────────────

    /// Read a record without touching its state.
    pub async fn lookup(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        Ok(self.store.get_key(key_id).await?)
    }

    /// Read the other half of a record's pairing.
    pub async fn lookup_peer(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        Ok(self.store.get_peer(key_id).await?)
    }

    /// Retrieve a key half for its bound party.
    ///
    /// Checks run in the order existence, authorization, expiry, state. A
    /// STORED or CACHED record moves to SERVED; a SERVED record may be
    /// fetched again until it is consumed.
    pub async fn fetch(&self, key_id: &KeyId, caller: &Identity) -> Result<FetchedKey> {
        let record = self.checked(key_id, caller).await?;

        let record = match record.state {
            KeyState::Consumed => {
                return Err(KmError::invalid_state(key_id, record.state, "key already consumed"))
            }
            KeyState::Served => record,
            KeyState::Stored | KeyState::Cached => self.mark_served(key_id).await?,
        };

        let material = self.open(&record)?;
        debug!(key_id = %key_id, caller = %caller, "served key");
        Ok(FetchedKey { record, material })
    }

    async fn mark_served(&self, key_id: &KeyId) -> Result<KeyRecord> {
        let now = self.now();
        match self
            .store
            .advance(key_id, &[KeyState::Stored, KeyState::Cached], KeyState::Served, now)
            .await?
        {
            TransitionResult::Applied(record) => Ok(record),
            // A concurrent fetch served it first; the bound party may re-fetch.
            TransitionResult::Rejected {
                current: KeyState::Served,
            } => self.lookup(key_id).await?.ok_or_else(|| not_found(key_id)),
            TransitionResult::Rejected { current } => {
                Err(KmError::invalid_state(key_id, current, "key already consumed"))
            }
            TransitionResult::Missing => Err(not_found(key_id)),
        }
    }

    /// Mark a served key as used.
    ///
    /// Consuming an already consumed key is a no-op success for its bound
    /// party.
    pub async fn consume(&self, key_id: &KeyId, caller: &Identity) -> Result<KeyRecord> {
        let record = self.checked(key_id, caller).await?;

        match record.state {
            KeyState::Consumed => Ok(record),
            KeyState::Stored | KeyState::Cached => Err(KmError::invalid_state(
                key_id,
                record.state,
                "key must be retrieved before it is consumed",
            )),
            KeyState::Served => {
                let now = self.now();
                match self
                    .store
                    .advance(key_id, &[KeyState::Served], KeyState::Consumed, now)
                    .await?
                {
                    TransitionResult::Applied(record) => {
                        info!(key_id = %key_id, caller = %caller, "consumed key");
                        Ok(record)
                    }
                    TransitionResult::Rejected {
                        current: KeyState::Consumed,
                    } => self.lookup(key_id).await?.ok_or_else(|| not_found(key_id)),
                    TransitionResult::Rejected { current } => Err(KmError::invalid_state(
                        key_id,
                        current,
                        "key must be retrieved before it is consumed",
                    )),
                    TransitionResult::Missing => Err(not_found(key_id)),
                }
            }
        }
    }

    async fn checked(&self, key_id: &KeyId, caller: &Identity) -> Result<KeyRecord> {
        let record = self.lookup(key_id).await?.ok_or_else(|| not_found(key_id))?;
        self.authorize(&record, caller)?;
        if record.is_expired(self.now()) {
            return Err(KmError::Expired(key_id.to_string()));
        }
        Ok(record)
    }

    fn authorize(&self, record: &KeyRecord, caller: &Identity) -> Result<()> {
        if record.is_bound_to(caller) {
            return Ok(());
        }
        warn!(key_id = %record.key_id, caller = %caller, "identity mismatch");
        Err(KmError::Forbidden(format!(
            "{caller} is not the {} of key {}",
            record.role.as_str(),
            record.key_id
        )))
    }

    fn open(&self, record: &KeyRecord) -> Result<KeyMaterial> {
        let aad = record_aad(record.key_id.as_str(), record.pairing_id.as_str());
        let material = self.master.open_material(&record.sealed_material, &aad)?;
        material.check_size(record.key_size_bits)?;
        Ok(material)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Delete every record past its expiry, whatever its state.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self.store.delete_expired(self.now()).await?;
        if removed > 0 {
            info!(removed, "purged expired keys");
        }
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<StateCounts> {
        Ok(self.store.count_by_state(self.now()).await?)
    }

    pub async fn list(&self, identity: &Identity, limit: usize) -> Result<Vec<KeySummary>> {
        Ok(self.store.list_for_identity(identity, limit).await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // KEM directory
    // ─────────────────────────────────────────────────────────────────────

    /// Publish a KEM keypair for `identity`, or return the one already
    /// published.
    ///
    /// Concurrent callers all get the same public key.
    pub async fn ensure_kem(&self, identity: &Identity) -> Result<KemPublicKey> {
        if let Some(public) = self.kem_public(identity).await? {
            return Ok(public);
        }
        let (record, _) = self.new_kem_record(identity)?;
        let stored = self.store.insert_kem_record(&record).await?;
        if stored.public_key == record.public_key {
            info!(identity = %identity, algorithm = KEM_ALGORITHM, "registered KEM key");
        }
        Ok(KemPublicKey::from_bytes(&stored.public_key)?)
    }

    /// Register a first KEM keypair for `identity`, on behalf of its owner.
    pub async fn register_kem(&self, identity: &Identity, caller: &Identity) -> Result<KemPublicKey> {
        owner_only(identity, caller)?;

        let (record, public) = self.new_kem_record(identity)?;
        let stored = self.store.insert_kem_record(&record).await?;
        if stored.public_key != record.public_key {
            return Err(KmError::AlreadyExists(format!(
                "{identity} already has a KEM key; rotate it instead"
            )));
        }
        info!(identity = %identity, algorithm = KEM_ALGORITHM, "registered KEM key");
        Ok(public)
    }

    /// Replace the KEM keypair of `identity`, on behalf of its owner.
    ///
    /// Mail sealed to the old public key can no longer be opened.
    pub async fn rotate_kem(&self, identity: &Identity, caller: &Identity) -> Result<KemPublicKey> {
        owner_only(identity, caller)?;

        let (record, public) = self.new_kem_record(identity)?;
        self.store.replace_kem_record(&record).await?;
        info!(identity = %identity, algorithm = KEM_ALGORITHM, "rotated KEM key");
        Ok(public)
    }

    fn new_kem_record(&self, identity: &Identity) -> Result<(KemRecord, KemPublicKey)> {
        let pair = KemKeyPair::generate();
        let sealed = self
            .master
            .seal(pair.private.as_bytes(), &kem_aad(identity))?
            .to_bytes()?;

        let record = KemRecord {
            identity: identity.clone(),
            algorithm: KEM_ALGORITHM.to_string(),
            public_key: pair.public.as_bytes().to_vec(),
            sealed_private_key: sealed,
            created_at: self.now(),
        };
        Ok((record, pair.public))
    }

    pub async fn kem_public(&self, identity: &Identity) -> Result<Option<KemPublicKey>> {
        match self.store.get_kem_record(identity).await? {
            Some(record) => Ok(Some(KemPublicKey::from_bytes(&record.public_key)?)),
            None => Ok(None),
        }
    }

    /// Open the private KEM key for its owner.
    pub async fn kem_private(&self, identity: &Identity, caller: &Identity) -> Result<KemPrivateKey> {
        let record = self
            .store
            .get_kem_record(identity)
            .await?
            .ok_or_else(|| KmError::NotFound(format!("no KEM key for {identity}")))?;
        owner_only(identity, caller)?;

        let envelope = SealedEnvelope::from_bytes(&record.sealed_private_key)?;
        let bytes = Zeroizing::new(self.master.open(&envelope, &kem_aad(identity))?);
        Ok(KemPrivateKey::from_bytes(&bytes)?)
    }
}

fn not_found(key_id: &KeyId) -> KmError {
    KmError::NotFound(format!("key {key_id}"))
}

fn ttl_millis(ttl: Duration) -> i64 {
    ttl.as_millis().min(i64::MAX as u128) as i64
}

fn owner_only(identity: &Identity, caller: &Identity) -> Result<()> {
    if caller != identity {
        warn!(identity = %identity, caller = %caller, "KEM key access by non-owner");
        return Err(KmError::Forbidden(format!("{caller} does not own the KEM key of {identity}")));
    }
    Ok(())
}

fn kem_aad(identity: &Identity) -> Vec<u8> {
    let mut aad = b"kem\0".to_vec();
    aad.extend_from_slice(identity.as_str().as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use qkm_core::ManualClock;
    use qkm_store::MemoryStore;

    fn alice() -> Identity {
        Identity::parse("alice@example.com").unwrap()
    }

    fn bob() -> Identity {
        Identity::parse("bob@example.com").unwrap()
    }

    fn carol() -> Identity {
        Identity::parse("carol@example.com").unwrap()
    }

    fn lifecycle() -> (KeyLifecycle<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let lifecycle = KeyLifecycle::new(
            Arc::new(MemoryStore::new()),
            MasterKey::from_bytes([9; 32]),
            ChannelSimulator::with_seed(7),
            0.0,
        )
        .with_clock(Arc::new(clock.clone()));
        (lifecycle, clock)
    }

    #[tokio::test]
    async fn test_allocate_persists_matching_halves() {
        let (lc, _) = lifecycle();
        let pair = lc.allocate_pair(&alice(), &bob(), 256, Duration::from_secs(60)).await.unwrap();

        assert_eq!(pair.initiator.state, KeyState::Stored);
        assert_eq!(pair.responder.state, KeyState::Stored);
        assert_eq!(pair.initiator.pairing_id, pair.responder.pairing_id);
        assert_eq!(pair.initiator.expires_at, 1_000 + 60_000);
        assert_ne!(pair.initiator.sealed_material, pair.responder.sealed_material);

        let a = lc.fetch(&pair.initiator.key_id, &alice()).await.unwrap();
        let b = lc.fetch(&pair.responder.key_id, &bob()).await.unwrap();
        assert_eq!(a.material, b.material);
        assert_eq!(a.material.len(), 32);
        assert_eq!(lc.sessions(), 1);
    }

    #[tokio::test]
    async fn test_fetch_checks_identity_before_expiry() {
        let (lc, clock) = lifecycle();
        let pair = lc.allocate_pair(&alice(), &bob(), 128, Duration::from_secs(1)).await.unwrap();

        clock.advance(5_000);
        let err = lc.fetch(&pair.initiator.key_id, &bob()).await.unwrap_err();
        assert!(matches!(err, KmError::Forbidden(_)));
        let err = lc.fetch(&pair.initiator.key_id, &alice()).await.unwrap_err();
        assert!(matches!(err, KmError::Expired(_)));

        assert_eq!(lc.purge_expired().await.unwrap(), 2);
        let err = lc.fetch(&pair.initiator.key_id, &alice()).await.unwrap_err();
        assert!(matches!(err, KmError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_requires_served() {
        let (lc, _) = lifecycle();
        let pair = lc.allocate_pair(&alice(), &bob(), 64, Duration::from_secs(60)).await.unwrap();
        let id = &pair.responder.key_id;

        let err = lc.consume(id, &bob()).await.unwrap_err();
        assert!(matches!(err, KmError::InvalidState { state: KeyState::Stored, .. }));

        lc.fetch(id, &bob()).await.unwrap();
        let refetch = lc.fetch(id, &bob()).await.unwrap();
        assert_eq!(refetch.record.state, KeyState::Served);

        let consumed = lc.consume(id, &bob()).await.unwrap();
        assert_eq!(consumed.state, KeyState::Consumed);
        assert_eq!(consumed.consumed_at, Some(1_000));

        // Idempotent for the bound party, still forbidden for anyone else.
        lc.consume(id, &bob()).await.unwrap();
        assert!(matches!(lc.consume(id, &alice()).await, Err(KmError::Forbidden(_))));

        let err = lc.fetch(id, &bob()).await.unwrap_err();
        assert!(matches!(err, KmError::InvalidState { state: KeyState::Consumed, .. }));
    }

    #[tokio::test]
    async fn test_claim_only_once() {
        let (lc, _) = lifecycle();
        let pair = lc.allocate_pair(&alice(), &bob(), 64, Duration::from_secs(60)).await.unwrap();

        let first = lc.claim(&pair.initiator.key_id, &alice()).await.unwrap();
        assert!(first.is_some());
        assert!(lc.claim(&pair.initiator.key_id, &alice()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stage_for_pickup() {
        let (lc, _) = lifecycle();
        let pair = lc.allocate_pair(&alice(), &bob(), 64, Duration::from_secs(60)).await.unwrap();

        lc.stage_for_pickup(&pair.responder.key_id).await.unwrap();
        let staged = lc.lookup(&pair.responder.key_id).await.unwrap().unwrap();
        assert_eq!(staged.state, KeyState::Cached);

        // Staging twice is harmless.
        lc.stage_for_pickup(&pair.responder.key_id).await.unwrap();
        let fetched = lc.fetch(&pair.responder.key_id, &bob()).await.unwrap();
        assert_eq!(fetched.record.state, KeyState::Served);
    }

    #[tokio::test]
    async fn test_find_spare_returns_both_halves() {
        let (lc, _) = lifecycle();
        let minute = Duration::from_secs(60);
        assert!(lc.find_spare(&alice(), &bob(), 64, minute).await.unwrap().is_none());

        let pair = lc.allocate_pair(&alice(), &bob(), 64, minute).await.unwrap();
        let (initiator, responder) = lc.find_spare(&alice(), &bob(), 64, minute).await.unwrap().unwrap();
        assert_eq!(initiator.key_id, pair.initiator.key_id);
        assert_eq!(responder.key_id, pair.responder.key_id);
    }

    #[tokio::test]
    async fn test_find_spare_respects_requested_ttl() {
        let (lc, clock) = lifecycle();
        lc.allocate_pair(&alice(), &bob(), 64, Duration::from_secs(3_600)).await.unwrap();

        assert!(lc
            .find_spare(&alice(), &bob(), 64, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        // Once the remaining lifetime fits, the spare is eligible.
        clock.advance(3_560_000);
        assert!(lc
            .find_spare(&alice(), &bob(), 64, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_kem_private_key_owner_only() {
        let (lc, _) = lifecycle();
        assert!(lc.kem_public(&bob()).await.unwrap().is_none());

        let public = lc.register_kem(&bob(), &bob()).await.unwrap();
        assert_eq!(lc.kem_public(&bob()).await.unwrap(), Some(public));

        assert!(lc.kem_private(&bob(), &bob()).await.is_ok());
        assert!(matches!(
            lc.kem_private(&bob(), &alice()).await,
            Err(KmError::Forbidden(_))
        ));
        assert!(matches!(
            lc.kem_private(&alice(), &alice()).await,
            Err(KmError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_kem_never_replaces() {
        let (lc, _) = lifecycle();
        assert!(matches!(
            lc.register_kem(&bob(), &alice()).await,
            Err(KmError::Forbidden(_))
        ));
        assert!(lc.kem_public(&bob()).await.unwrap().is_none());

        let public = lc.register_kem(&bob(), &bob()).await.unwrap();
        assert!(matches!(
            lc.register_kem(&bob(), &bob()).await,
            Err(KmError::AlreadyExists(_))
        ));
        assert_eq!(lc.ensure_kem(&bob()).await.unwrap(), public);

        assert!(matches!(
            lc.rotate_kem(&bob(), &alice()).await,
            Err(KmError::Forbidden(_))
        ));
        let rotated = lc.rotate_kem(&bob(), &bob()).await.unwrap();
        assert_ne!(rotated, public);
        assert_eq!(lc.kem_public(&bob()).await.unwrap(), Some(rotated));
    }

    #[tokio::test]
    async fn test_ensure_kem_is_stable() {
        let (lc, _) = lifecycle();
        let first = lc.ensure_kem(&carol()).await.unwrap();
        let second = lc.ensure_kem(&carol()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_agreement_failure_surfaces() {
        let lc = KeyLifecycle::new(
            Arc::new(MemoryStore::new()),
            MasterKey::generate(),
            ChannelSimulator::with_seed(1),
            0.5,
        );
        let err = lc.allocate_pair(&alice(), &bob(), 64, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, KmError::AgreementFailure(_)));
        assert_eq!(lc.counts().await.unwrap().total(), 0);
    }
}
