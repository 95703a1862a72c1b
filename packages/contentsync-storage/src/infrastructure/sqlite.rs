//! SQLite ledger and status log
//!
//! File-based persistent storage. The ledger table is keyed by
//! (object_id, source, environment, locale); the status log table is
//! append-only (no UPDATE or DELETE statement touches it).
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::models::{
    IndexingLedgerEntry, LedgerKey, PassState, SourcePass, StatusLogRecord, SyncStatus,
};
use crate::domain::ports::{IndexingLedger, StatusLogSink};
use crate::error::{Result, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const LEDGER_COLUMNS: &str = "object_id, source, environment, locale, checksum, transaction_id, \
     sites, created_at, modified_at, status, standalone";

fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Ledger and status log share the file from separate connections
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    Ok(conn)
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::corrupt(format!("Invalid timestamp: {}", ms)))
}

/// Raw ledger row; converted outside the rusqlite closure so that bad
/// status strings or site JSON surface as `StorageError::corrupt`
struct LedgerRow {
    object_id: String,
    source: String,
    environment: String,
    locale: String,
    checksum: String,
    transaction_id: String,
    sites: String,
    created_at: i64,
    modified_at: i64,
    status: String,
    standalone: bool,
}

impl LedgerRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            object_id: row.get(0)?,
            source: row.get(1)?,
            environment: row.get(2)?,
            locale: row.get(3)?,
            checksum: row.get(4)?,
            transaction_id: row.get(5)?,
            sites: row.get(6)?,
            created_at: row.get(7)?,
            modified_at: row.get(8)?,
            status: row.get(9)?,
            standalone: row.get(10)?,
        })
    }

    fn into_entry(self) -> Result<IndexingLedgerEntry> {
        Ok(IndexingLedgerEntry {
            object_id: self.object_id,
            source: self.source,
            environment: self.environment,
            locale: self.locale,
            checksum: self.checksum,
            transaction_id: self.transaction_id,
            sites: serde_json::from_str(&self.sites)?,
            created_at: millis_to_datetime(self.created_at)?,
            modified_at: millis_to_datetime(self.modified_at)?,
            status: SyncStatus::from_str(&self.status)?,
            standalone: self.standalone,
        })
    }
}

/// SQLite-based indexing ledger
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (or create) a ledger at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(open_connection(db_path.as_ref())?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite ledger (for testing)
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS indexing_ledger (
                object_id TEXT NOT NULL,
                source TEXT NOT NULL,
                environment TEXT NOT NULL,
                locale TEXT NOT NULL,
                checksum TEXT NOT NULL,
                transaction_id TEXT NOT NULL,
                sites TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                standalone BOOLEAN NOT NULL DEFAULT 0,
                PRIMARY KEY (object_id, source, environment, locale)
            )",
            [],
        )?;

        // Reconciliation scans by source + transaction
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_source_tx
             ON indexing_ledger(source, transaction_id, standalone)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS source_pass (
                source TEXT PRIMARY KEY,
                transaction_id TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn query_entries(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<IndexingLedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, LedgerRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(LedgerRow::into_entry).collect()
    }
}

#[async_trait]
impl IndexingLedger for SqliteLedger {
    async fn get(&self, key: &LedgerKey) -> Result<Option<IndexingLedgerEntry>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!(
                    "SELECT {} FROM indexing_ledger
                     WHERE object_id = ?1 AND source = ?2 AND environment = ?3 AND locale = ?4",
                    LEDGER_COLUMNS
                ),
                params![&key.object_id, &key.source, &key.environment, &key.locale],
                LedgerRow::read,
            )
            .optional()?
        };
        row.map(LedgerRow::into_entry).transpose()
    }

    async fn upsert(&self, entry: &IndexingLedgerEntry) -> Result<()> {
        let sites = serde_json::to_string(&entry.sites)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO indexing_ledger ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                LEDGER_COLUMNS
            ),
            params![
                &entry.object_id,
                &entry.source,
                &entry.environment,
                &entry.locale,
                &entry.checksum,
                &entry.transaction_id,
                sites,
                entry.created_at.timestamp_millis(),
                entry.modified_at.timestamp_millis(),
                entry.status.as_str(),
                entry.standalone,
            ],
        )?;
        Ok(())
    }

    async fn touch_transaction(&self, key: &LedgerKey, transaction_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE indexing_ledger
             SET transaction_id = ?5, standalone = 0, status = ?6
             WHERE object_id = ?1 AND source = ?2 AND environment = ?3 AND locale = ?4",
            params![
                &key.object_id,
                &key.source,
                &key.environment,
                &key.locale,
                transaction_id,
                SyncStatus::Skipped.as_str(),
            ],
        )?;
        Ok(updated > 0)
    }

    async fn delete(&self, key: &LedgerKey) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM indexing_ledger
             WHERE object_id = ?1 AND source = ?2 AND environment = ?3 AND locale = ?4",
            params![&key.object_id, &key.source, &key.environment, &key.locale],
        )?;
        Ok(deleted > 0)
    }

    async fn delete_batch(&self, keys: &[LedgerKey]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM indexing_ledger
                 WHERE object_id = ?1 AND source = ?2 AND environment = ?3 AND locale = ?4",
            )?;
            for key in keys {
                deleted += stmt.execute(params![
                    &key.object_id,
                    &key.source,
                    &key.environment,
                    &key.locale
                ])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    async fn find_stale(
        &self,
        source: &str,
        transaction_id: &str,
    ) -> Result<Vec<IndexingLedgerEntry>> {
        self.query_entries(
            &format!(
                "SELECT {} FROM indexing_ledger
                 WHERE source = ?1 AND transaction_id <> ?2 AND standalone = 0
                 ORDER BY object_id, environment, locale",
                LEDGER_COLUMNS
            ),
            &[&source, &transaction_id],
        )
    }

    async fn list_by_source(&self, source: &str) -> Result<Vec<IndexingLedgerEntry>> {
        self.query_entries(
            &format!(
                "SELECT {} FROM indexing_ledger
                 WHERE source = ?1
                 ORDER BY object_id, environment, locale",
                LEDGER_COLUMNS
            ),
            &[&source],
        )
    }

    async fn count(&self, source: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM indexing_ledger WHERE source = ?1",
            params![source],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn record_pass(&self, pass: &SourcePass) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO source_pass (source, transaction_id, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &pass.source,
                &pass.transaction_id,
                pass.state.as_str(),
                pass.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn latest_pass(&self, source: &str) -> Result<Option<SourcePass>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT transaction_id, state, updated_at FROM source_pass WHERE source = ?1",
                params![source],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?
        };

        row.map(|(transaction_id, state, updated_at)| {
            Ok(SourcePass {
                source: source.to_string(),
                transaction_id,
                state: PassState::from_str(&state)?,
                updated_at: millis_to_datetime(updated_at)?,
            })
        })
        .transpose()
    }
}

/// SQLite-based append-only status log
#[derive(Clone)]
pub struct SqliteStatusLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStatusLog {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(open_connection(db_path.as_ref())?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS status_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id TEXT,
                source TEXT NOT NULL,
                transaction_id TEXT NOT NULL,
                environment TEXT NOT NULL,
                locale TEXT NOT NULL,
                sites TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                checksum TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_status_log_object
             ON status_log(object_id, id)",
            [],
        )?;
        Ok(())
    }

    fn insert(conn: &Connection, record: &StatusLogRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO status_log (object_id, source, transaction_id, environment, locale,
                                     sites, action, status, reason, checksum, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &record.object_id,
                &record.source,
                &record.transaction_id,
                &record.environment,
                &record.locale,
                serde_json::to_string(&record.sites)?,
                &record.action,
                record.status.as_str(),
                &record.reason,
                &record.checksum,
                record.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Records of one object in append order
    pub fn records_for(&self, object_id: &str) -> Result<Vec<StatusLogRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT object_id, source, transaction_id, environment, locale, sites, action,
                    status, reason, checksum, created_at
             FROM status_log WHERE object_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![object_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, i64>(10)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(object_id, source, transaction_id, environment, locale, sites, action, status, reason, checksum, ts)| {
                    Ok(StatusLogRecord {
                        object_id,
                        source,
                        transaction_id,
                        environment,
                        locale,
                        sites: serde_json::from_str(&sites)?,
                        action,
                        status: SyncStatus::from_str(&status)?,
                        reason,
                        checksum,
                        timestamp: millis_to_datetime(ts)?,
                    })
                },
            )
            .collect()
    }

    pub fn count_status(&self, status: SyncStatus) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM status_log WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl StatusLogSink for SqliteStatusLog {
    async fn append(&self, record: &StatusLogRecord) -> Result<()> {
        let conn = self.conn.lock();
        Self::insert(&conn, record)
    }

    async fn append_all(&self, records: &[StatusLogRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            Self::insert(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }
}
