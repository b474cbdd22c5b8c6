//! The key delivery service.
//!
//! Implements the request, retrieve, consume, status and cleanup operations
//! on top of [`KeyLifecycle`]. Authorization is always re-derived from the
//! stored requester and recipient; callers never assert a role.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qkm_core::{ChannelSimulator, Clock, Identity, KeyId, KeyRecord, PartyRole};
use qkm_crypto::{KemPrivateKey, KemPublicKey, MasterKey, KEM_ALGORITHM};
use qkm_store::Store;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{KmError, Result};
use crate::lifecycle::{FetchedKey, KeyLifecycle};
use crate::protocol::{
    encode_b64, parse_identity, CleanupResponse, ConsumeKey, ConsumeResponse, KemKeyResponse,
    KeyDelivery, ListKeys, ListKeysResponse, RequestKey, RetrieveKey, StatusResponse, ValidRequest,
};

type PairKey = (Identity, Identity);
type PairLock = Arc<tokio::sync::Mutex<()>>;
type PairLocks = Mutex<HashMap<PairKey, PairLock>>;

/// The delivery protocol over a [`Store`].
pub struct KeyDeliveryService<S: Store> {
    lifecycle: KeyLifecycle<S>,
    config: ServiceConfig,
    pair_locks: PairLocks,
}

/// One caller's handle on an identity pair's delivery lock.
///
/// The last handle to drop removes the table entry.
struct PairSlot<'a> {
    table: &'a PairLocks,
    key: PairKey,
    lock: PairLock,
}

impl Drop for PairSlot<'_> {
    fn drop(&mut self) {
        let Ok(mut locks) = self.table.lock() else {
            return;
        };
        // Held by the table and this slot only.
        let idle = locks
            .get(&self.key)
            .is_some_and(|held| Arc::ptr_eq(held, &self.lock) && Arc::strong_count(held) == 2);
        if idle {
            locks.remove(&self.key);
        }
    }
}

impl<S: Store> KeyDeliveryService<S> {
    /// Create a service over `store`.
    pub fn new(store: Arc<S>, master: MasterKey, config: ServiceConfig) -> Self {
        let simulator = match config.simulator_seed {
            Some(seed) => ChannelSimulator::with_seed(seed),
            None => ChannelSimulator::new(),
        };
        info!(
            master_key = %master.fingerprint(),
            error_rate = config.error_rate,
            pool_reuse = config.pool_reuse,
            "starting key delivery service"
        );
        Self {
            lifecycle: KeyLifecycle::new(store, master, simulator, config.error_rate),
            config,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.lifecycle = self.lifecycle.with_clock(clock);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &KeyLifecycle<S> {
        &self.lifecycle
    }

    // ─────────────────────────────────────────────────────────────────────
    // Delivery protocol
    // ─────────────────────────────────────────────────────────────────────

    /// Deliver a fresh key half to the initiator.
    pub async fn request_key(&self, req: &RequestKey) -> Result<KeyDelivery> {
        let valid = req.validate(&self.config)?;
        let fetched = self.deliver(&valid).await?;
        Ok(KeyDelivery::new(&fetched.record, &fetched.material))
    }

    /// Deliver a key half to its bound party.
    ///
    /// The recipient may pass the initiator's key id; it is mapped to the
    /// responder half of the same pairing.
    pub async fn retrieve_key(&self, req: &RetrieveKey) -> Result<KeyDelivery> {
        let (key_id, caller) = req.validate()?;
        let fetched = self.retrieve(&key_id, &caller).await?;
        Ok(KeyDelivery::new(&fetched.record, &fetched.material))
    }

    /// Mark a retrieved key as used.
    pub async fn consume_key(&self, req: &ConsumeKey) -> Result<ConsumeResponse> {
        let (key_id, caller) = req.validate()?;
        let record = self.consume(&key_id, &caller).await?;
        Ok(ConsumeResponse::consumed(&record.key_id))
    }

    /// Aggregate counts by state.
    pub async fn status(&self) -> Result<StatusResponse> {
        let counts = self
            .bounded("status", self.read_with_retry("status", || self.lifecycle.counts()))
            .await?;
        Ok(StatusResponse {
            stored_count: counts.stored,
            cached_count: counts.cached,
            served_count: counts.served,
            consumed_count: counts.consumed,
            expired_count: counts.expired,
            error_rate_configured: self.lifecycle.error_rate(),
            sessions: self.lifecycle.sessions(),
        })
    }

    /// Purge expired records.
    pub async fn cleanup(&self) -> Result<CleanupResponse> {
        let removed_count = self.bounded("cleanup", self.lifecycle.purge_expired()).await?;
        Ok(CleanupResponse { removed_count })
    }

    /// Key metadata for an identity, newest first.
    pub async fn list_keys(&self, req: &ListKeys) -> Result<ListKeysResponse> {
        let (identity, limit) = req.validate()?;
        let keys = self
            .bounded(
                "list_keys",
                self.read_with_retry("list_keys", || self.lifecycle.list(&identity, limit)),
            )
            .await?;
        Ok(ListKeysResponse { keys })
    }

    // ─────────────────────────────────────────────────────────────────────
    // KEM directory
    // ─────────────────────────────────────────────────────────────────────

    /// Generate and publish a first KEM keypair for `identity`.
    ///
    /// Only the owner may register, and an existing keypair is never
    /// replaced; use [`rotate_kem_key`](Self::rotate_kem_key) for that.
    pub async fn register_kem_key(&self, identity: &str, caller: &str) -> Result<KemKeyResponse> {
        let identity = parse_identity("identity", identity)?;
        let caller = parse_identity("caller", caller)?;
        let public = self
            .bounded("register_kem_key", self.lifecycle.register_kem(&identity, &caller))
            .await?;
        Ok(kem_response(&identity, &public))
    }

    /// Replace the KEM keypair of `identity`, for its owner only.
    pub async fn rotate_kem_key(&self, identity: &str, caller: &str) -> Result<KemKeyResponse> {
        let identity = parse_identity("identity", identity)?;
        let caller = parse_identity("caller", caller)?;
        let public = self
            .bounded("rotate_kem_key", self.lifecycle.rotate_kem(&identity, &caller))
            .await?;
        Ok(kem_response(&identity, &public))
    }

    /// The published KEM public key of `identity`.
    pub async fn kem_public_key(&self, identity: &str) -> Result<KemKeyResponse> {
        let identity = parse_identity("identity", identity)?;
        let public = self.kem_public(&identity).await?;
        Ok(kem_response(&identity, &public))
    }

    /// The private KEM key of `identity`, for its owner only.
    pub async fn kem_private_key(&self, identity: &str, caller: &str) -> Result<KemPrivateKey> {
        let identity = parse_identity("identity", identity)?;
        let caller = parse_identity("caller", caller)?;
        self.kem_private(&identity, &caller).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed internals shared with SecureMail
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) async fn deliver(&self, req: &ValidRequest) -> Result<FetchedKey> {
        self.bounded("request_key", self.deliver_locked(req)).await
    }

    pub(crate) async fn retrieve(&self, key_id: &KeyId, caller: &Identity) -> Result<FetchedKey> {
        self.bounded("retrieve_key", self.fetch_resolved(key_id, caller))
            .await
    }

    async fn kem_public(&self, identity: &Identity) -> Result<KemPublicKey> {
        self.bounded(
            "kem_public_key",
            self.read_with_retry("kem_public_key", || self.lifecycle.kem_public(identity)),
        )
        .await?
        .ok_or_else(|| KmError::NotFound(format!("no KEM key for {identity}")))
    }

    /// The published KEM key of `identity`, registering one if none exists.
    pub(crate) async fn ensure_kem(&self, identity: &Identity) -> Result<KemPublicKey> {
        self.bounded("kem_public_key", self.lifecycle.ensure_kem(identity))
            .await
    }

    pub(crate) async fn consume(&self, key_id: &KeyId, caller: &Identity) -> Result<KeyRecord> {
        self.bounded("consume_key", self.consume_resolved(key_id, caller))
            .await
    }

    pub(crate) async fn kem_private(&self, identity: &Identity, caller: &Identity) -> Result<KemPrivateKey> {
        self.bounded("kem_private_key", self.lifecycle.kem_private(identity, caller))
            .await
    }

    async fn deliver_locked(&self, req: &ValidRequest) -> Result<FetchedKey> {
        let slot = self.pair_slot(&req.requester, &req.recipient)?;
        let _guard = slot.lock.lock().await;

        let fetched = self.claim_or_allocate(req).await?;
        let peer = self.peer_id(&fetched.record).await?;
        self.lifecycle.stage_for_pickup(&peer).await?;

        info!(
            key_id = %fetched.record.key_id,
            pairing_id = %fetched.record.pairing_id,
            requester = %req.requester,
            recipient = %req.recipient,
            "delivered key to initiator"
        );
        Ok(fetched)
    }

    async fn fetch_resolved(&self, key_id: &KeyId, caller: &Identity) -> Result<FetchedKey> {
        let target = self.resolve(key_id, caller).await?;
        self.lifecycle.fetch(&target, caller).await
    }

    async fn consume_resolved(&self, key_id: &KeyId, caller: &Identity) -> Result<KeyRecord> {
        let target = self.resolve(key_id, caller).await?;
        // Mutating: never retried here.
        self.lifecycle.consume(&target, caller).await
    }

    async fn claim_or_allocate(&self, req: &ValidRequest) -> Result<FetchedKey> {
        if self.config.pool_reuse {
            while let Some((initiator, _)) = self
                .lifecycle
                .find_spare(&req.requester, &req.recipient, req.size_bits, req.ttl)
                .await?
            {
                match self.lifecycle.claim(&initiator.key_id, &req.requester).await {
                    Ok(Some(fetched)) => {
                        debug!(key_id = %initiator.key_id, "reused spare pairing");
                        return Ok(fetched);
                    }
                    Ok(None) | Err(KmError::Expired(_)) => continue,
                    Err(err) => return Err(err),
                }
            }
        }

        let extra = if self.config.pool_reuse { self.config.prefetch } else { 0 };
        let mut first = None;
        for _ in 0..=extra {
            let pair = self
                .lifecycle
                .allocate_pair(&req.requester, &req.recipient, req.size_bits, req.ttl)
                .await?;
            first.get_or_insert(pair.initiator.key_id);
        }
        let key_id = first.ok_or_else(|| KmError::Internal("no pairing allocated".into()))?;

        self.lifecycle
            .claim(&key_id, &req.requester)
            .await?
            .ok_or_else(|| KmError::Internal(format!("fresh key {key_id} claimed elsewhere")))
    }

    /// Map `key_id` to the half `caller` is bound to.
    ///
    /// Existence and authorization are checked here; both reads are retried.
    async fn resolve(&self, key_id: &KeyId, caller: &Identity) -> Result<KeyId> {
        let record = self
            .read_with_retry("lookup", || self.lifecycle.lookup(key_id))
            .await?
            .ok_or_else(|| KmError::NotFound(format!("key {key_id}")))?;

        if record.is_bound_to(caller) {
            return Ok(record.key_id);
        }
        if record.role == PartyRole::Initiator && &record.recipient == caller {
            let peer = self
                .read_with_retry("lookup_peer", || self.lifecycle.lookup_peer(key_id))
                .await?
                .ok_or_else(|| KmError::NotFound(format!("peer of key {key_id}")))?;
            debug!(key_id = %key_id, peer = %peer.key_id, "mapped initiator key id to responder half");
            return Ok(peer.key_id);
        }

        warn!(key_id = %key_id, caller = %caller, "identity mismatch");
        Err(KmError::Forbidden(format!(
            "{caller} is not a party to key {key_id}"
        )))
    }

    async fn peer_id(&self, record: &KeyRecord) -> Result<KeyId> {
        self.read_with_retry("lookup_peer", || self.lifecycle.lookup_peer(&record.key_id))
            .await?
            .map(|peer| peer.key_id)
            .ok_or_else(|| KmError::Internal(format!("key {} has no peer half", record.key_id)))
    }

    fn pair_slot(&self, requester: &Identity, recipient: &Identity) -> Result<PairSlot<'_>> {
        let key = (requester.clone(), recipient.clone());
        let mut locks = self
            .pair_locks
            .lock()
            .map_err(|_| KmError::Internal("pair lock table poisoned".into()))?;
        let lock = locks.entry(key.clone()).or_default().clone();
        Ok(PairSlot {
            table: &self.pair_locks,
            key,
            lock,
        })
    }

    #[cfg(test)]
    fn pair_lock_count(&self) -> usize {
        self.pair_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    async fn bounded<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?self.config.io_timeout, "operation timed out");
                Err(KmError::Timeout {
                    operation,
                    elapsed: self.config.io_timeout,
                })
            }
        }
    }

    /// Retry a read-only call on storage errors.
    async fn read_with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(KmError::Storage(err)) if attempt < self.config.read_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %err, "retrying read");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }
}

fn kem_response(identity: &Identity, public: &KemPublicKey) -> KemKeyResponse {
    KemKeyResponse {
        identity: identity.to_string(),
        algorithm: KEM_ALGORITHM.to_string(),
        public_key_b64: encode_b64(public.as_bytes()),
    }
}

/// Run [`KeyDeliveryService::cleanup`] every `interval`.
///
/// The first purge runs after one full interval. Abort the handle to stop.
pub fn spawn_purge_task<S>(service: Arc<KeyDeliveryService<S>>, interval: Duration) -> JoinHandle<()>
where
    S: Store + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service.cleanup().await {
                Ok(resp) => debug!(removed = resp.removed_count, "periodic purge"),
                Err(err) => warn!(error = %err, "periodic purge failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qkm_core::{KeyState, ManualClock};
    use qkm_store::MemoryStore;

    const ALICE: &str = "alice@example.com";
    const BOB: &str = "bob@example.com";

    fn service(config: ServiceConfig) -> (KeyDeliveryService<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(0);
        let service = KeyDeliveryService::new(
            Arc::new(MemoryStore::new()),
            MasterKey::from_bytes([3; 32]),
            ServiceConfig {
                simulator_seed: Some(11),
                ..config
            },
        )
        .with_clock(Arc::new(clock.clone()));
        (service, clock)
    }

    #[tokio::test]
    async fn test_request_stages_peer_half() {
        let (svc, _) = service(ServiceConfig::default());
        let delivery = svc.request_key(&RequestKey::new(ALICE, BOB).size_bits(128)).await.unwrap();
        assert_eq!(delivery.size_bits, 128);
        assert_eq!(delivery.material().unwrap().len(), 16);

        let status = svc.status().await.unwrap();
        assert_eq!(status.served_count, 1);
        assert_eq!(status.cached_count, 1);
        assert_eq!(status.stored_count, 0);
        assert_eq!(status.sessions, 1);
    }

    #[tokio::test]
    async fn test_recipient_uses_initiator_key_id() {
        let (svc, _) = service(ServiceConfig::default());
        let sent = svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();

        let got = svc.retrieve_key(&RetrieveKey::new(&sent.key_id, BOB)).await.unwrap();
        assert_ne!(got.key_id, sent.key_id);
        assert_eq!(got.key_material_b64, sent.key_material_b64);

        // Either id works for consume.
        let resp = svc.consume_key(&ConsumeKey::new(&sent.key_id, BOB)).await.unwrap();
        assert_eq!(resp.status, "consumed");
        assert_eq!(resp.key_id, got.key_id);
        svc.consume_key(&ConsumeKey::new(&got.key_id, BOB)).await.unwrap();

        let err = svc.retrieve_key(&RetrieveKey::new(&sent.key_id, BOB)).await.unwrap_err();
        assert!(matches!(err, KmError::InvalidState { state: KeyState::Consumed, .. }));
    }

    #[tokio::test]
    async fn test_initiator_cannot_take_responder_half() {
        let (svc, _) = service(ServiceConfig::default());
        let sent = svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        let got = svc.retrieve_key(&RetrieveKey::new(&sent.key_id, BOB)).await.unwrap();

        let err = svc.retrieve_key(&RetrieveKey::new(&got.key_id, ALICE)).await.unwrap_err();
        assert!(matches!(err, KmError::Forbidden(_)));
        let err = svc
            .retrieve_key(&RetrieveKey::new(&sent.key_id, "mallory@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, KmError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_pool_reuse_with_prefetch() {
        let (svc, _) = service(ServiceConfig {
            pool_reuse: true,
            prefetch: 2,
            ..ServiceConfig::default()
        });

        let first = svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        assert_eq!(svc.status().await.unwrap().sessions, 3);

        let second = svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        let third = svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        assert_eq!(svc.status().await.unwrap().sessions, 3);
        assert_ne!(first.key_id, second.key_id);
        assert_ne!(second.key_id, third.key_id);

        svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        assert_eq!(svc.status().await.unwrap().sessions, 6);
    }

    #[tokio::test]
    async fn test_no_pooling_by_default() {
        let (svc, _) = service(ServiceConfig {
            prefetch: 5,
            ..ServiceConfig::default()
        });
        svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        assert_eq!(svc.status().await.unwrap().sessions, 2);
    }

    #[tokio::test]
    async fn test_list_keys() {
        let (svc, clock) = service(ServiceConfig::default());
        let first = svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();
        clock.advance(10);
        let second = svc.request_key(&RequestKey::new(ALICE, BOB)).await.unwrap();

        let listed = svc
            .list_keys(&ListKeys {
                identity: ALICE.into(),
                limit: None,
            })
            .await
            .unwrap();
        let ids: Vec<_> = listed.keys.iter().map(|k| k.key_id.to_string()).collect();
        assert_eq!(ids, vec![second.key_id, first.key_id]);
    }

    #[tokio::test]
    async fn test_kem_directory() {
        let (svc, _) = service(ServiceConfig::default());
        assert!(matches!(
            svc.kem_public_key(BOB).await,
            Err(KmError::NotFound(_))
        ));

        let registered = svc.register_kem_key(BOB, BOB).await.unwrap();
        let published = svc.kem_public_key(BOB).await.unwrap();
        assert_eq!(registered, published);
        assert_eq!(published.algorithm, "ML-KEM-768");

        assert!(svc.kem_private_key(BOB, BOB).await.is_ok());
        assert!(matches!(
            svc.kem_private_key(BOB, ALICE).await,
            Err(KmError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_kem_registration_is_owner_only() {
        let (svc, _) = service(ServiceConfig::default());

        let err = svc.register_kem_key(BOB, ALICE).await.unwrap_err();
        assert!(matches!(err, KmError::Forbidden(_)));
        assert!(matches!(svc.kem_public_key(BOB).await, Err(KmError::NotFound(_))));

        let registered = svc.register_kem_key(BOB, BOB).await.unwrap();
        let err = svc.register_kem_key(BOB, BOB).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
        assert_eq!(svc.kem_public_key(BOB).await.unwrap(), registered);

        let err = svc.rotate_kem_key(BOB, ALICE).await.unwrap_err();
        assert!(matches!(err, KmError::Forbidden(_)));
        assert_eq!(svc.kem_public_key(BOB).await.unwrap(), registered);

        let rotated = svc.rotate_kem_key(BOB, BOB).await.unwrap();
        assert_ne!(rotated.public_key_b64, registered.public_key_b64);
        assert_eq!(svc.kem_public_key(BOB).await.unwrap(), rotated);
    }

    #[tokio::test]
    async fn test_pair_locks_released_after_delivery() {
        let (svc, _) = service(ServiceConfig::default());
        for i in 0..50 {
            let sender = format!("sender{i}@example.com");
            svc.request_key(&RequestKey::new(&sender, BOB)).await.unwrap();
        }
        assert_eq!(svc.pair_lock_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pair_locks_released_under_contention() {
        let (svc, _) = service(ServiceConfig {
            pool_reuse: true,
            prefetch: 1,
            ..ServiceConfig::default()
        });
        let svc = Arc::new(svc);

        let mut tasks = Vec::new();
        for i in 0..24 {
            let svc = Arc::clone(&svc);
            let sender = format!("sender{}@example.com", i % 3);
            tasks.push(tokio::spawn(async move {
                svc.request_key(&RequestKey::new(&sender, BOB)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(svc.pair_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_pooled_spare_never_outlives_requested_ttl() {
        let (svc, _) = service(ServiceConfig {
            pool_reuse: true,
            prefetch: 1,
            ..ServiceConfig::default()
        });

        let long = svc
            .request_key(&RequestKey::new(ALICE, BOB).ttl_seconds(3_600))
            .await
            .unwrap();
        assert_eq!(svc.status().await.unwrap().sessions, 2);

        // The hour-long spare is too long-lived for a one-minute request.
        let short = svc
            .request_key(&RequestKey::new(ALICE, BOB).ttl_seconds(60))
            .await
            .unwrap();
        assert_eq!(svc.status().await.unwrap().sessions, 4);
        assert_eq!(short.expires_at, 60_000);
        assert_eq!(long.expires_at, 3_600_000);

        // An hour-long request may take either spare.
        svc.request_key(&RequestKey::new(ALICE, BOB).ttl_seconds(3_600))
            .await
            .unwrap();
        assert_eq!(svc.status().await.unwrap().sessions, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_runs_on_interval() {
        let (svc, clock) = service(ServiceConfig::default());
        let svc = Arc::new(svc);
        svc.request_key(&RequestKey::new(ALICE, BOB).ttl_seconds(1)).await.unwrap();
        clock.advance(2_000);

        let handle = spawn_purge_task(svc.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let status = svc.status().await.unwrap();
        assert_eq!(status.expired_count, 0);
        assert_eq!(status.served_count + status.cached_count, 0);
        handle.abort();
    }
}
