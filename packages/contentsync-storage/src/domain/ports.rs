//! Storage ports
//!
//! Port/Adapter pattern for backend flexibility:
//! - SQLite (durable ledger + append-only status log)
//! - InMemory (tests, dry runs)
//! - Cached (lookup cache in front of any ledger)

use async_trait::async_trait;

use super::models::{IndexingLedgerEntry, LedgerKey, SourcePass, StatusLogRecord};
use crate::error::Result;

/// Indexing ledger port
///
/// One entry per (object id, source, environment, locale). Writers are the
/// change detector (touch), the forwarder (upsert/delete) and the reconciler
/// (stale lookup + delete).
#[async_trait]
pub trait IndexingLedger: Send + Sync {
    /// Get the entry for a key
    async fn get(&self, key: &LedgerKey) -> Result<Option<IndexingLedgerEntry>>;

    /// Insert or replace the entry at `entry.key()`
    async fn upsert(&self, entry: &IndexingLedgerEntry) -> Result<()>;

    /// Stamp `transaction_id` on an existing entry without touching
    /// `modified_at` or the checksum. Also clears the standalone flag: the
    /// entry is now confirmed by a full session.
    ///
    /// Returns false if no entry exists for the key.
    async fn touch_transaction(&self, key: &LedgerKey, transaction_id: &str) -> Result<bool>;

    /// Remove an entry. Removing an absent entry is a no-op (returns false).
    async fn delete(&self, key: &LedgerKey) -> Result<bool>;

    /// Remove many entries atomically; returns the number actually removed
    async fn delete_batch(&self, keys: &[LedgerKey]) -> Result<usize>;

    /// Entries of `source` not confirmed by `transaction_id`, excluding
    /// standalone-originated entries
    async fn find_stale(&self, source: &str, transaction_id: &str)
        -> Result<Vec<IndexingLedgerEntry>>;

    /// All entries of a source, ordered by object id then locale
    async fn list_by_source(&self, source: &str) -> Result<Vec<IndexingLedgerEntry>>;

    /// Number of entries of a source
    async fn count(&self, source: &str) -> Result<usize>;

    /// Replace the latest full pass recorded for `pass.source`
    async fn record_pass(&self, pass: &SourcePass) -> Result<()>;

    /// Latest full pass of a source, if any was recorded
    async fn latest_pass(&self, source: &str) -> Result<Option<SourcePass>>;
}

/// Append-only status log port
#[async_trait]
pub trait StatusLogSink: Send + Sync {
    async fn append(&self, record: &StatusLogRecord) -> Result<()>;

    /// Append several records; default appends one by one
    async fn append_all(&self, records: &[StatusLogRecord]) -> Result<()> {
        for record in records {
            self.append(record).await?;
        }
        Ok(())
    }
}
