//! Store trait: the abstract interface for key record persistence.
//!
//! This trait keeps the lifecycle layer storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use qkm_core::{Identity, KemRecord, KeyId, KeyRecord, KeyState, KeySummary, StateCounts};

use crate::error::Result;

/// Outcome of a conditional state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The record was in an allowed state and has moved. Carries the
    /// updated record.
    Applied(KeyRecord),
    /// The record exists but was not in an allowed state; nothing changed.
    Rejected {
        /// The state the record is actually in.
        current: KeyState,
    },
    /// No record with that id.
    Missing,
}

/// The Store trait: async interface for key record persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Atomic pairs**: Both halves of a pairing are written in one transaction
///   or not at all.
/// - **Compare-and-set transitions**: [`Store::advance`] only moves a record
///   forward from one of the listed states, so two concurrent claims on the
///   same record cannot both succeed.
/// - **Explicit time**: Every time-dependent call takes `now` in Unix
///   milliseconds; the store never reads the clock for record semantics.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Key Records
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert both halves of a pairing atomically.
    ///
    /// Fails with `Conflict` if either key id or pairing slot is taken.
    async fn insert_pair(&self, initiator: &KeyRecord, responder: &KeyRecord) -> Result<()>;

    /// Get a record by key id.
    async fn get_key(&self, key_id: &KeyId) -> Result<Option<KeyRecord>>;

    /// Get the other half of the pairing `key_id` belongs to.
    async fn get_peer(&self, key_id: &KeyId) -> Result<Option<KeyRecord>>;

    /// Find the oldest never-delivered initiator half minted for
    /// `(requester, recipient)` at exactly `key_size_bits`, with
    /// `now < expires_at <= latest_expiry`.
    async fn find_spare(
        &self,
        requester: &Identity,
        recipient: &Identity,
        key_size_bits: usize,
        now: i64,
        latest_expiry: i64,
    ) -> Result<Option<KeyRecord>>;

    /// Move a record to `to` if its current state is in `from` and the move
    /// is forward.
    ///
    /// Sets `served_at` on the first move into `Served` and `consumed_at`
    /// on the move into `Consumed`.
    async fn advance(
        &self,
        key_id: &KeyId,
        from: &[KeyState],
        to: KeyState,
        at: i64,
    ) -> Result<TransitionResult>;

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete every record with `expires_at <= now`, in any state.
    ///
    /// Returns the number of records removed.
    async fn delete_expired(&self, now: i64) -> Result<u64>;

    /// Count records by state. Expired records are counted under `expired`
    /// only.
    async fn count_by_state(&self, now: i64) -> Result<StateCounts>;

    /// List metadata for records bound to `identity`, newest first.
    async fn list_for_identity(&self, identity: &Identity, limit: usize) -> Result<Vec<KeySummary>>;

    // ─────────────────────────────────────────────────────────────────────────
    // KEM Directory
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert the KEM keypair for an identity unless one exists.
    ///
    /// Returns the record now stored, which is `record` only if the insert
    /// won.
    async fn insert_kem_record(&self, record: &KemRecord) -> Result<KemRecord>;

    /// Replace the KEM keypair for an identity, inserting if absent.
    async fn replace_kem_record(&self, record: &KemRecord) -> Result<()>;

    /// Get the KEM keypair for an identity.
    async fn get_kem_record(&self, identity: &Identity) -> Result<Option<KemRecord>>;
}

/// Apply a forward transition to an in-hand record.
///
/// Shared by the backends so both stamp timestamps identically.
pub(crate) fn apply_transition(
    record: &KeyRecord,
    from: &[KeyState],
    to: KeyState,
    at: i64,
) -> std::result::Result<KeyRecord, KeyState> {
    if !from.contains(&record.state) || !record.state.can_advance_to(to) {
        return Err(record.state);
    }

    let mut next = record.clone();
    next.state = to;
    if to >= KeyState::Served && next.served_at.is_none() {
        next.served_at = Some(at);
    }
    if to == KeyState::Consumed {
        next.consumed_at = Some(at);
    }
    Ok(next)
}
