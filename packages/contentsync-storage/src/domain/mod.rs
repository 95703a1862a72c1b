//! Domain layer: ledger and status-log models plus their ports

pub mod models;
pub mod ports;

pub use models::{
    IndexingLedgerEntry, LedgerKey, PassState, SourcePass, StatusLogRecord, SyncStatus,
};
pub use ports::{IndexingLedger, StatusLogSink};
