use crate::config::ConfigError;
use contentsync_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid job item: {0}")]
    InvalidJobItem(String),

    #[error("Source '{source_name}' already has an active full session ({active_transaction})")]
    SessionConflict {
        source_name: String,
        active_transaction: String,
    },

    #[error("Session not open: {0}")]
    SessionNotOpen(String),

    #[error("Timeout: {pending} batch(es) of transaction {transaction_id} still in flight")]
    DrainTimeout {
        transaction_id: String,
        pending: usize,
    },

    #[error("Search engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Search engine rejected request ({status}): {message}")]
    EngineRejected { status: u16, message: String },

    #[error("Unknown search engine type: {0}")]
    UnknownEngine(String),

    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error(
        "Reconciliation of '{source_name}' for transaction {transaction_id} incomplete \
         after {deleted} deletion(s): {message}"
    )]
    Reconciliation {
        source_name: String,
        transaction_id: String,
        deleted: usize,
        message: String,
    },

    #[error("Session {transaction_id} incomplete: {dead_lettered} batch(es) dead-lettered")]
    SessionIncomplete {
        transaction_id: String,
        dead_lettered: usize,
    },

    #[error("Transaction {transaction_id} of '{source_name}' cannot be reconciled: {reason}")]
    NotReconcilable {
        source_name: String,
        transaction_id: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidJobItem(e.to_string())
    }

    /// Retry classification
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Storage(e) if e.kind.is_retryable() => ErrorCategory::Transient,
            SyncError::Storage(_) => ErrorCategory::Permanent,
            SyncError::EngineUnavailable(_)
            | SyncError::DrainTimeout { .. }
            | SyncError::Reconciliation { .. } => ErrorCategory::Transient,
            SyncError::QueueClosed(_) | SyncError::Io(_) => ErrorCategory::Infrastructure,
            SyncError::Config(_)
            | SyncError::Serialization(_)
            | SyncError::InvalidJobItem(_)
            | SyncError::SessionConflict { .. }
            | SyncError::SessionNotOpen(_)
            | SyncError::SessionIncomplete { .. }
            | SyncError::NotReconcilable { .. }
            | SyncError::EngineRejected { .. }
            | SyncError::UnknownEngine(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::serialization(err)
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - redeliver (e.g., engine unreachable, database busy)
    Transient,
    /// Permanent error - don't retry (e.g., rejected payload, unknown target)
    Permanent,
    /// Infrastructure error - alert ops (e.g., queue gone, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(SyncError::Serialization(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
