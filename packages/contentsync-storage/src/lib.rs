//! contentsync-storage - Indexing ledger and status log
//!
//! > "An object stays in the index only while a full pass keeps confirming it."
//!
//! ## Core Principles
//!
//! 1. **Ledger key**: `(object_id, source, environment, locale)` is unique
//! 2. **Transaction stamp**: every confirmation writes the pass's transaction id,
//!    even when the checksum is unchanged
//! 3. **Append-only status log**: records are written once, never updated
//!
//! ## Usage
//!
//! ```rust,ignore
//! use contentsync_storage::{IndexingLedger, IndexingLedgerEntry, LedgerKey, SqliteLedger};
//!
//! let ledger = SqliteLedger::open("ledger.db")?;
//! let key = LedgerKey::new("p1", "docs", "live", "en");
//! ledger.upsert(&IndexingLedgerEntry::new(key.clone(), "h1", "tx-1", vec!["docs".into()])).await?;
//!
//! // Unchanged content confirmed by the next pass
//! ledger.touch_transaction(&key, "tx-2").await?;
//!
//! // Content not revisited by tx-2
//! let stale = ledger.find_stale("docs", "tx-2").await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    IndexingLedger, IndexingLedgerEntry, LedgerKey, PassState, SourcePass, StatusLogRecord,
    StatusLogSink, SyncStatus,
};

pub use infrastructure::{CachedLedger, InMemoryLedger, InMemoryStatusLog};

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteLedger, SqliteStatusLog};
