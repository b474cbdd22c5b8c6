//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use qkm_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per key half
        CREATE TABLE key_records (
            key_id TEXT PRIMARY KEY,
            pairing_id TEXT NOT NULL,
            role INTEGER NOT NULL,            -- 0=initiator, 1=responder
            sealed_material BLOB NOT NULL,    -- CBOR envelope under the master key
            key_size_bits INTEGER NOT NULL,
            requester TEXT NOT NULL,
            recipient TEXT NOT NULL,
            state INTEGER NOT NULL,           -- 0=stored, 1=cached, 2=served, 3=consumed
            created_at INTEGER NOT NULL,      -- Unix ms
            expires_at INTEGER NOT NULL,      -- Unix ms
            served_at INTEGER,
            consumed_at INTEGER,
            algorithm TEXT NOT NULL,

            UNIQUE(pairing_id, role)
        );

        -- Long-lived KEM keypairs, one per identity
        CREATE TABLE kem_records (
            identity TEXT PRIMARY KEY,
            algorithm TEXT NOT NULL,
            public_key BLOB NOT NULL,
            sealed_private_key BLOB NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX idx_key_records_parties_state ON key_records(requester, recipient, state);
        CREATE INDEX idx_key_records_expires ON key_records(expires_at);
        CREATE INDEX idx_key_records_pairing ON key_records(pairing_id);
        "#,
    )?;

    Ok(())
}
