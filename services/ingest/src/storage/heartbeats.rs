//! Append-only SQLite store for heartbeat records.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL, busy_timeout=5s.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! # Concurrency
//! A `HeartbeatStore` owns a single connection and needs `&mut self` to
//! append. The service shares it as `Arc<tokio::sync::Mutex<_>>`, so writes
//! are serialized in-process. Readers (the dashboard) use their own
//! connections; WAL lets them read while the service writes.

use super::schema::{apply_schema, insert_sql};
use chrono::{DateTime, SecondsFormat, Utc};
use halo_wire::{Heartbeat, SensorFields};
use rusqlite::{Connection, params_from_iter};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One heartbeat ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    /// Server-side receipt instant.
    pub received_at: DateTime<Utc>,
    pub mac: String,
    pub name: String,
    pub site: Option<String>,
    pub fields: SensorFields,
}

impl HeartbeatRecord {
    pub fn from_heartbeat(
        heartbeat: Heartbeat,
        received_at: DateTime<Utc>,
        site: Option<String>,
    ) -> Self {
        HeartbeatRecord {
            received_at,
            mac: heartbeat.mac,
            name: heartbeat.name,
            site,
            fields: heartbeat.fields,
        }
    }

    /// The value stored in the `timestamp` column.
    pub fn timestamp_text(&self) -> String {
        format_timestamp(self.received_at)
    }
}

/// RFC 3339, UTC, microsecond precision, `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

// ---------------------------------------------------------------------------
// HeartbeatStore
// ---------------------------------------------------------------------------

pub struct HeartbeatStore {
    conn: Connection,
    insert_sql: String,
}

impl HeartbeatStore {
    /// Open (or create) the store at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        let store = HeartbeatStore {
            conn,
            insert_sql: insert_sql(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create-if-absent schema setup. Safe to call on every start.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        apply_schema(&self.conn)?;
        Ok(())
    }

    /// Insert one record and return its row id.
    ///
    /// Fields without a value are written as NULL.
    pub fn append(&mut self, record: &HeartbeatRecord) -> Result<i64, StoreError> {
        if record.mac.is_empty() {
            return Err(StoreError::InvalidRecord("mac must not be empty".to_owned()));
        }
        if record.name.is_empty() {
            return Err(StoreError::InvalidRecord("name must not be empty".to_owned()));
        }

        let timestamp = record.timestamp_text();
        let values = [
            Some(timestamp.as_str()),
            Some(record.mac.as_str()),
            Some(record.name.as_str()),
            record.site.as_deref(),
        ]
        .into_iter()
        .chain(record.fields.iter().map(|(_, v)| v));

        let mut stmt = self.conn.prepare_cached(&self.insert_sql)?;
        stmt.execute(params_from_iter(values))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Count all stored heartbeats.
    pub fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", super::schema::TABLE_NAME),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count stored heartbeats for one identifier.
    pub fn count_for_mac(&self, mac: &str) -> Result<i64, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE mac = ?1",
                super::schema::TABLE_NAME
            ),
            [mac],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;",
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}
