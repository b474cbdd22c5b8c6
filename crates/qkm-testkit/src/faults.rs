//! Fault injection for storage.
//!
//! [`FaultyStore`] wraps any [`Store`] and fails or delays calls on demand,
//! so tests can observe how the service retries, gives up and times out.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use qkm_core::{Identity, KemRecord, KeyId, KeyRecord, KeyState, KeySummary, StateCounts};
use qkm_store::{Result, Store, StoreError, TransitionResult};

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

/// A [`Store`] that fails the next N reads or writes and can add latency.
///
/// Reads are `get_key`, `get_peer`, `count_by_state`, `list_for_identity`
/// and `get_kem_record`. Every other call, `find_spare` included, sits on
/// a mutating path and counts as a write.
pub struct FaultyStore<S> {
    inner: S,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
    reads: AtomicU32,
    writes: AtomicU32,
    delay_millis: AtomicU64,
}

impl<S: Store> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing_reads: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            delay_millis: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` reads with a storage error.
    pub fn fail_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with a storage error.
    pub fn fail_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Sleep for `delay` before every call.
    pub fn set_delay(&self, delay: Duration) {
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        self.delay_millis.store(millis, Ordering::SeqCst);
    }

    /// Read attempts so far, failed ones included.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Write attempts so far, failed ones included.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Zero both attempt counters.
    pub fn reset_counts(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn enter(&self, access: Access) -> Result<()> {
        let delay = self.delay_millis.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let (attempts, failing) = match access {
            Access::Read => (&self.reads, &self.failing_reads),
            Access::Write => (&self.writes, &self.failing_writes),
        };
        attempts.fetch_add(1, Ordering::SeqCst);
        let injected = failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Io(std::io::Error::other("injected storage fault")));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Store> Store for FaultyStore<S> {
    async fn insert_pair(&self, initiator: &KeyRecord, responder: &KeyRecord) -> Result<()> {
        self.enter(Access::Write).await?;
        self.inner.insert_pair(initiator, responder).await
    }

    async fn get_key(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        self.enter(Access::Read).await?;
        self.inner.get_key(key_id).await
    }

    async fn get_peer(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        self.enter(Access::Read).await?;
        self.inner.get_peer(key_id).await
    }

    async fn find_spare(
        &self,
        requester: &Identity,
        recipient: &Identity,
        key_size_bits: usize,
        now: i64,
        latest_expiry: i64,
    ) -> Result<Option<KeyRecord>> {
        self.enter(Access::Write).await?;
        self.inner
            .find_spare(requester, recipient, key_size_bits, now, latest_expiry)
            .await
    }

    async fn advance(
        &self,
        key_id: &KeyId,
        from: &[KeyState],
        to: KeyState,
        at: i64,
    ) -> Result<TransitionResult> {
        self.enter(Access::Write).await?;
        self.inner.advance(key_id, from, to, at).await
    }

    async fn delete_expired(&self, now: i64) -> Result<u64> {
        self.enter(Access::Write).await?;
        self.inner.delete_expired(now).await
    }

    async fn count_by_state(&self, now: i64) -> Result<StateCounts> {
        self.enter(Access::Read).await?;
        self.inner.count_by_state(now).await
    }

    async fn list_for_identity(&self, identity: &Identity, limit: usize) -> Result<Vec<KeySummary>> {
        self.enter(Access::Read).await?;
        self.inner.list_for_identity(identity, limit).await
    }

    async fn insert_kem_record(&self, record: &KemRecord) -> Result<KemRecord> {
        self.enter(Access::Write).await?;
        self.inner.insert_kem_record(record).await
    }

    async fn replace_kem_record(&self, record: &KemRecord) -> Result<()> {
        self.enter(Access::Write).await?;
        self.inner.replace_kem_record(record).await
    }

    async fn get_kem_record(&self, identity: &Identity) -> Result<Option<KemRecord>> {
        self.enter(Access::Read).await?;
        self.inner.get_kem_record(identity).await
    }
}
