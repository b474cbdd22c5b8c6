//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use qkm_core::{
    Identity, KemRecord, KeyId, KeyRecord, KeyState, KeySummary, PairingId, PartyRole, StateCounts,
};

use crate::error::{Result, StoreError};
use crate::traits::{apply_transition, Store, TransitionResult};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Records indexed by key id.
    records: HashMap<KeyId, KeyRecord>,

    /// Pairing index: pairing id -> key ids of both halves.
    pairings: HashMap<PairingId, Vec<KeyId>>,

    /// KEM keypairs by identity.
    kem: HashMap<Identity, KemRecord>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn slot_taken(&self, record: &KeyRecord) -> bool {
        self.records.contains_key(&record.key_id)
            || self
                .pairings
                .get(&record.pairing_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| self.records.get(id))
                        .any(|r| r.role == record.role)
                })
                .unwrap_or(false)
    }

    fn insert(&mut self, record: KeyRecord) {
        self.pairings
            .entry(record.pairing_id.clone())
            .or_default()
            .push(record.key_id.clone());
        self.records.insert(record.key_id.clone(), record);
    }

    fn remove(&mut self, key_id: &KeyId) {
        if let Some(record) = self.records.remove(key_id) {
            if let Some(ids) = self.pairings.get_mut(&record.pairing_id) {
                ids.retain(|id| id != key_id);
                if ids.is_empty() {
                    self.pairings.remove(&record.pairing_id);
                }
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_pair(&self, initiator: &KeyRecord, responder: &KeyRecord) -> Result<()> {
        let mut inner = self.write()?;

        for record in [initiator, responder] {
            if inner.slot_taken(record) {
                return Err(StoreError::Conflict(format!(
                    "key {} or pairing slot {}/{} already exists",
                    record.key_id,
                    record.pairing_id,
                    record.role.as_str()
                )));
            }
        }
        if initiator.key_id == responder.key_id
            || (initiator.pairing_id == responder.pairing_id && initiator.role == responder.role)
        {
            return Err(StoreError::Conflict(format!(
                "pair halves collide on key {}",
                initiator.key_id
            )));
        }

        inner.insert(initiator.clone());
        inner.insert(responder.clone());
        Ok(())
    }

    async fn get_key(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        let inner = self.read()?;
        Ok(inner.records.get(key_id).cloned())
    }

    async fn get_peer(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        let inner = self.read()?;

        let Some(record) = inner.records.get(key_id) else {
            return Ok(None);
        };

        Ok(inner
            .pairings
            .get(&record.pairing_id)
            .into_iter()
            .flatten()
            .filter(|id| *id != key_id)
            .find_map(|id| inner.records.get(id))
            .cloned())
    }

    async fn find_spare(
        &self,
        requester: &Identity,
        recipient: &Identity,
        key_size_bits: usize,
        now: i64,
        latest_expiry: i64,
    ) -> Result<Option<KeyRecord>> {
        let inner = self.read()?;

        Ok(inner
            .records
            .values()
            .filter(|r| {
                r.role == PartyRole::Initiator
                    && r.state == KeyState::Stored
                    && &r.requester == requester
                    && &r.recipient == recipient
                    && r.key_size_bits == key_size_bits
                    && !r.is_expired(now)
                    && r.expires_at <= latest_expiry
            })
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.key_id.cmp(&b.key_id))
            })
            .cloned())
    }

    async fn advance(
        &self,
        key_id: &KeyId,
        from: &[KeyState],
        to: KeyState,
        at: i64,
    ) -> Result<TransitionResult> {
        let mut inner = self.write()?;

        let Some(record) = inner.records.get_mut(key_id) else {
            return Ok(TransitionResult::Missing);
        };

        match apply_transition(record, from, to, at) {
            Ok(next) => {
                *record = next.clone();
                Ok(TransitionResult::Applied(next))
            }
            Err(current) => Ok(TransitionResult::Rejected { current }),
        }
    }

    async fn delete_expired(&self, now: i64) -> Result<u64> {
        let mut inner = self.write()?;

        let expired: Vec<KeyId> = inner
            .records
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.key_id.clone())
            .collect();

        for key_id in &expired {
            inner.remove(key_id);
        }
        Ok(expired.len() as u64)
    }

    async fn count_by_state(&self, now: i64) -> Result<StateCounts> {
        let inner = self.read()?;

        let mut counts = StateCounts::default();
        for record in inner.records.values() {
            if record.is_expired(now) {
                counts.expired += 1;
            } else {
                counts.record(record.state);
            }
        }
        Ok(counts)
    }

    async fn list_for_identity(&self, identity: &Identity, limit: usize) -> Result<Vec<KeySummary>> {
        let inner = self.read()?;

        let mut matching: Vec<&KeyRecord> = inner
            .records
            .values()
            .filter(|r| r.is_bound_to(identity))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.key_id.cmp(&b.key_id))
        });

        Ok(matching
            .into_iter()
            .take(limit)
            .map(KeyRecord::summary)
            .collect())
    }

    async fn insert_kem_record(&self, record: &KemRecord) -> Result<KemRecord> {
        let mut inner = self.write()?;
        Ok(inner
            .kem
            .entry(record.identity.clone())
            .or_insert_with(|| record.clone())
            .clone())
    }

    async fn replace_kem_record(&self, record: &KemRecord) -> Result<()> {
        let mut inner = self.write()?;
        inner.kem.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn get_kem_record(&self, identity: &Identity) -> Result<Option<KemRecord>> {
        let inner = self.read()?;
        Ok(inner.kem.get(identity).cloned())
    }
}
