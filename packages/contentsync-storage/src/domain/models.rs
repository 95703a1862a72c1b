//! Ledger and status-log domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Ledger
// ═══════════════════════════════════════════════════════════════════════════

/// Unique key of a ledger entry: (object id, source, environment, locale)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerKey {
    pub object_id: String,
    pub source: String,
    pub environment: String,
    pub locale: String,
}

impl LedgerKey {
    pub fn new(
        object_id: impl Into<String>,
        source: impl Into<String>,
        environment: impl Into<String>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            source: source.into(),
            environment: environment.into(),
            locale: locale.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}/{}",
            self.object_id, self.source, self.environment, self.locale
        )
    }
}

/// Durable record of an object confirmed into the search index
///
/// Owned by the synchronization engine. Created on the first successful
/// index, refreshed on every re-confirmation, removed by an explicit DELETE
/// or by reconciliation.
///
/// # Examples
///
/// ```rust
/// use contentsync_storage::{IndexingLedgerEntry, LedgerKey};
///
/// let key = LedgerKey::new("p1", "docs", "live", "en");
/// let entry = IndexingLedgerEntry::new(key.clone(), "h1", "tx-1", vec!["docs".into()]);
/// assert_eq!(entry.key(), key);
/// assert!(!entry.standalone);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingLedgerEntry {
    pub object_id: String,
    pub source: String,
    pub environment: String,
    pub locale: String,
    /// Content fingerprint of the last indexed version
    pub checksum: String,
    /// Synchronization pass that last confirmed this entry
    pub transaction_id: String,
    /// Sites the object is currently indexed into
    pub sites: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Last lifecycle status that wrote this entry
    pub status: SyncStatus,
    /// Created by a standalone session and not yet confirmed by a full one.
    /// Such entries are outside reconciliation scope.
    #[serde(default)]
    pub standalone: bool,
}

impl IndexingLedgerEntry {
    pub fn new(
        key: LedgerKey,
        checksum: impl Into<String>,
        transaction_id: impl Into<String>,
        sites: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            object_id: key.object_id,
            source: key.source,
            environment: key.environment,
            locale: key.locale,
            checksum: checksum.into(),
            transaction_id: transaction_id.into(),
            sites,
            created_at: now,
            modified_at: now,
            status: SyncStatus::Indexed,
            standalone: false,
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(
            self.object_id.clone(),
            self.source.clone(),
            self.environment.clone(),
            self.locale.clone(),
        )
    }

    pub fn with_standalone(mut self, standalone: bool) -> Self {
        self.standalone = standalone;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Source passes
// ═══════════════════════════════════════════════════════════════════════════

/// Where the latest full pass of a source stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassState {
    /// Session opened, items may still be in flight
    Open,
    /// Every batch was indexed or ignored; the pass may be reconciled
    Drained,
    /// Abandoned, timed out, or lost a batch to the dead letter path
    Incomplete,
}

impl PassState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassState::Open => "OPEN",
            PassState::Drained => "DRAINED",
            PassState::Incomplete => "INCOMPLETE",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(PassState::Open),
            "DRAINED" => Ok(PassState::Drained),
            "INCOMPLETE" => Ok(PassState::Incomplete),
            _ => Err(StorageError::corrupt(format!("Invalid pass state: {}", s))),
        }
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Latest full pass of a source. Only that pass, once drained, may be
/// reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePass {
    pub source: String,
    pub transaction_id: String,
    pub state: PassState,
    pub updated_at: DateTime<Utc>,
}

impl SourcePass {
    pub fn new(
        source: impl Into<String>,
        transaction_id: impl Into<String>,
        state: PassState,
    ) -> Self {
        Self {
            source: source.into(),
            transaction_id: transaction_id.into(),
            state,
            updated_at: Utc::now(),
        }
    }

    /// Whether `transaction_id` is this pass and it drained cleanly
    pub fn allows_reconcile(&self, transaction_id: &str) -> bool {
        self.transaction_id == transaction_id && self.state == PassState::Drained
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Status log
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a job item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    #[serde(rename = "SENT_TO_QUEUE")]
    SentToQueue,
    #[serde(rename = "RECEIVED_AND_SENT_TO_TURING")]
    Received,
    #[serde(rename = "INDEXED")]
    Indexed,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "DEINDEXED")]
    Deindexed,
    #[serde(rename = "IGNORED")]
    Ignored,
    #[serde(rename = "ERROR")]
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::SentToQueue => "SENT_TO_QUEUE",
            SyncStatus::Received => "RECEIVED_AND_SENT_TO_TURING",
            SyncStatus::Indexed => "INDEXED",
            SyncStatus::Skipped => "SKIPPED",
            SyncStatus::Deindexed => "DEINDEXED",
            SyncStatus::Ignored => "IGNORED",
            SyncStatus::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "SENT_TO_QUEUE" => Ok(SyncStatus::SentToQueue),
            "RECEIVED_AND_SENT_TO_TURING" => Ok(SyncStatus::Received),
            "INDEXED" => Ok(SyncStatus::Indexed),
            "SKIPPED" => Ok(SyncStatus::Skipped),
            "DEINDEXED" => Ok(SyncStatus::Deindexed),
            "IGNORED" => Ok(SyncStatus::Ignored),
            "ERROR" => Ok(SyncStatus::Error),
            _ => Err(StorageError::corrupt(format!("Invalid sync status: {}", s))),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One lifecycle transition of one job item. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLogRecord {
    /// Absent for COMMIT markers
    pub object_id: Option<String>,
    pub source: String,
    pub transaction_id: String,
    pub environment: String,
    pub locale: String,
    pub sites: Vec<String>,
    /// Wire name of the job action (CREATE, DELETE, COMMIT)
    pub action: String,
    pub status: SyncStatus,
    pub reason: Option<String>,
    pub checksum: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusLogRecord {
    pub fn new(
        source: impl Into<String>,
        transaction_id: impl Into<String>,
        action: impl Into<String>,
        status: SyncStatus,
    ) -> Self {
        Self {
            object_id: None,
            source: source.into(),
            transaction_id: transaction_id.into(),
            environment: String::new(),
            locale: String::new(),
            sites: Vec::new(),
            action: action.into(),
            status,
            reason: None,
            checksum: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn with_target(
        mut self,
        environment: impl Into<String>,
        locale: impl Into<String>,
        sites: Vec<String>,
    ) -> Self {
        self.environment = environment.into();
        self.locale = locale.into();
        self.sites = sites;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }
}
