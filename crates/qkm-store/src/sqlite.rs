//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use qkm_core::{
    Identity, KemRecord, KeyId, KeyRecord, KeyState, KeySummary, PairingId, PartyRole, StateCounts,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{apply_transition, Store, TransitionResult};

const RECORD_COLUMNS: &str = "key_id, pairing_id, role, sealed_material, key_size_bits, \
     requester, recipient, state, created_at, expires_at, served_at, consumed_at, algorithm";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn identity_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Identity> {
    let raw: String = row.get(idx)?;
    Identity::parse(raw).map_err(|e| conversion_error(idx, Type::Text, e))
}

// Helper to convert a row to KeyRecord. Column order follows RECORD_COLUMNS.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRecord> {
    let role = PartyRole::from_u8(row.get(2)?)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(2, "role".into(), Type::Integer))?;
    let state = KeyState::from_u8(row.get(7)?)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(7, "state".into(), Type::Integer))?;
    let key_size_bits: i64 = row.get(4)?;

    Ok(KeyRecord {
        key_id: KeyId::new(row.get::<_, String>(0)?),
        pairing_id: PairingId::new(row.get::<_, String>(1)?),
        role,
        sealed_material: row.get(3)?,
        key_size_bits: usize::try_from(key_size_bits)
            .map_err(|e| conversion_error(4, Type::Integer, e))?,
        requester: identity_column(row, 5)?,
        recipient: identity_column(row, 6)?,
        state,
        created_at: row.get(8)?,
        expires_at: row.get(9)?,
        served_at: row.get(10)?,
        consumed_at: row.get(11)?,
        algorithm: row.get(12)?,
    })
}

fn row_to_kem(row: &rusqlite::Row<'_>) -> rusqlite::Result<KemRecord> {
    Ok(KemRecord {
        identity: identity_column(row, 0)?,
        algorithm: row.get(1)?,
        public_key: row.get(2)?,
        sealed_private_key: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn insert_record(conn: &Connection, record: &KeyRecord) -> Result<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO key_records ({RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            record.key_id.as_str(),
            record.pairing_id.as_str(),
            record.role.to_u8(),
            record.sealed_material,
            record.key_size_bits as i64,
            record.requester.as_str(),
            record.recipient.as_str(),
            record.state.to_u8(),
            record.created_at,
            record.expires_at,
            record.served_at,
            record.consumed_at,
            record.algorithm,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::Conflict(format!(
                "key {} or pairing slot {}/{} already exists",
                record.key_id,
                record.pairing_id,
                record.role.as_str()
            )))
        }
        Err(e) => Err(e.into()),
    }
}

fn select_key(conn: &Connection, key_id: &str) -> Result<Option<KeyRecord>> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM key_records WHERE key_id = ?1"),
        params![key_id],
        row_to_record,
    )
    .optional()
    .map_err(StoreError::from)
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_pair(&self, initiator: &KeyRecord, responder: &KeyRecord) -> Result<()> {
        let initiator = initiator.clone();
        let responder = responder.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            insert_record(&tx, &initiator)?;
            insert_record(&tx, &responder)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_key(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        let key_id = key_id.clone();
        self.blocking(move |conn| select_key(conn, key_id.as_str())).await
    }

    async fn get_peer(&self, key_id: &KeyId) -> Result<Option<KeyRecord>> {
        let key_id = key_id.clone();

        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM key_records
                     WHERE pairing_id = (SELECT pairing_id FROM key_records WHERE key_id = ?1)
                       AND key_id != ?1"
                ),
                params![key_id.as_str()],
                row_to_record,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn find_spare(
        &self,
        requester: &Identity,
        recipient: &Identity,
        key_size_bits: usize,
        now: i64,
        latest_expiry: i64,
    ) -> Result<Option<KeyRecord>> {
        let requester = requester.clone();
        let recipient = recipient.clone();

        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM key_records
                     WHERE requester = ?1 AND recipient = ?2 AND state = ?3
                       AND role = ?4 AND key_size_bits = ?5
                       AND expires_at > ?6 AND expires_at <= ?7
                     ORDER BY created_at ASC, key_id ASC
                     LIMIT 1"
                ),
                params![
                    requester.as_str(),
                    recipient.as_str(),
                    KeyState::Stored.to_u8(),
                    PartyRole::Initiator.to_u8(),
                    key_size_bits as i64,
                    now,
                    latest_expiry,
                ],
                row_to_record,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn advance(
        &self,
        key_id: &KeyId,
        from: &[KeyState],
        to: KeyState,
        at: i64,
    ) -> Result<TransitionResult> {
        let key_id = key_id.clone();
        let from = from.to_vec();

        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(current) = select_key(&tx, key_id.as_str())? else {
                return Ok(TransitionResult::Missing);
            };

            let next = match apply_transition(&current, &from, to, at) {
                Ok(next) => next,
                Err(state) => return Ok(TransitionResult::Rejected { current: state }),
            };

            // Guard on the observed state as well, in case another
            // connection shares the file.
            let changed = tx.execute(
                "UPDATE key_records
                 SET state = ?1, served_at = ?2, consumed_at = ?3
                 WHERE key_id = ?4 AND state = ?5",
                params![
                    next.state.to_u8(),
                    next.served_at,
                    next.consumed_at,
                    key_id.as_str(),
                    current.state.to_u8(),
                ],
            )?;
            tx.commit()?;

            if changed == 0 {
                return Ok(TransitionResult::Rejected {
                    current: current.state,
                });
            }
            Ok(TransitionResult::Applied(next))
        })
        .await
    }

    async fn delete_expired(&self, now: i64) -> Result<u64> {
        let removed = self
            .blocking(move |conn| {
                let n = conn.execute(
                    "DELETE FROM key_records WHERE expires_at <= ?1",
                    params![now],
                )?;
                Ok(n as u64)
            })
            .await?;

        if removed > 0 {
            tracing::debug!(removed, "deleted expired key records");
        }
        Ok(removed)
    }

    async fn count_by_state(&self, now: i64) -> Result<StateCounts> {
        self.blocking(move |conn| {
            let mut counts = StateCounts::default();

            let mut stmt = conn.prepare(
                "SELECT state, COUNT(*) FROM key_records WHERE expires_at > ?1 GROUP BY state",
            )?;
            let rows = stmt
                .query_map(params![now], |row| {
                    Ok((row.get::<_, u8>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (state, n) in rows {
                let state = KeyState::from_u8(state)
                    .ok_or_else(|| StoreError::InvalidData(format!("unknown state {state}")))?;
                match state {
                    KeyState::Stored => counts.stored = n as u64,
                    KeyState::Cached => counts.cached = n as u64,
                    KeyState::Served => counts.served = n as u64,
                    KeyState::Consumed => counts.consumed = n as u64,
                }
            }

            let expired: i64 = conn.query_row(
                "SELECT COUNT(*) FROM key_records WHERE expires_at <= ?1",
                params![now],
                |row| row.get(0),
            )?;
            counts.expired = expired as u64;

            Ok(counts)
        })
        .await
    }

    async fn list_for_identity(&self, identity: &Identity, limit: usize) -> Result<Vec<KeySummary>> {
        let identity = identity.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM key_records
                 WHERE (role = ?1 AND requester = ?3) OR (role = ?2 AND recipient = ?3)
                 ORDER BY created_at DESC, key_id ASC
                 LIMIT ?4"
            ))?;

            let summaries = stmt
                .query_map(
                    params![
                        PartyRole::Initiator.to_u8(),
                        PartyRole::Responder.to_u8(),
                        identity.as_str(),
                        limit as i64,
                    ],
                    row_to_record,
                )?
                .map(|r| r.map(|record| record.summary()))
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(summaries)
        })
        .await
    }

    async fn insert_kem_record(&self, record: &KemRecord) -> Result<KemRecord> {
        let record = record.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO kem_records (identity, algorithm, public_key, sealed_private_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(identity) DO NOTHING",
                params![
                    record.identity.as_str(),
                    record.algorithm,
                    record.public_key,
                    record.sealed_private_key,
                    record.created_at,
                ],
            )?;
            let stored = tx.query_row(
                "SELECT identity, algorithm, public_key, sealed_private_key, created_at
                 FROM kem_records WHERE identity = ?1",
                params![record.identity.as_str()],
                row_to_kem,
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn replace_kem_record(&self, record: &KemRecord) -> Result<()> {
        let record = record.clone();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO kem_records (identity, algorithm, public_key, sealed_private_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(identity) DO UPDATE SET
                    algorithm = excluded.algorithm,
                    public_key = excluded.public_key,
                    sealed_private_key = excluded.sealed_private_key,
                    created_at = excluded.created_at",
                params![
                    record.identity.as_str(),
                    record.algorithm,
                    record.public_key,
                    record.sealed_private_key,
                    record.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_kem_record(&self, identity: &Identity) -> Result<Option<KemRecord>> {
        let identity = identity.clone();

        self.blocking(move |conn| {
            conn.query_row(
                "SELECT identity, algorithm, public_key, sealed_private_key, created_at
                 FROM kem_records WHERE identity = ?1",
                params![identity.as_str()],
                row_to_kem,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[tokio::test]
    async fn test_insert_and_get_pair() {
        conformance::insert_and_get_pair(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_duplicate_pair_rejected() {
        conformance::duplicate_pair_rejected(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_advance_is_forward_only() {
        conformance::advance_is_forward_only(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_find_spare_filters() {
        conformance::find_spare_filters(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_expiry_purge_and_counts() {
        conformance::expiry_purge_and_counts(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_list_for_identity() {
        conformance::list_for_identity(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_kem_directory() {
        conformance::kem_directory(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        let (initiator, responder) = conformance::make_pair(256, 10_000);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_pair(&initiator, &responder).await.unwrap();
            store
                .advance(&initiator.key_id, &[KeyState::Stored], KeyState::Served, 5)
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let reloaded = store.get_key(&initiator.key_id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, KeyState::Served);
        assert_eq!(reloaded.served_at, Some(5));
        assert_eq!(reloaded.sealed_material, initiator.sealed_material);
    }
}
