/*
 * Contentsync Orchestration - Delta Indexing Engine
 *
 * Keeps a search index in step with many independent content sources.
 *
 * Architecture:
 * - Synchronization sessions (one transaction id per producer pass)
 * - Dispatch queue (at-least-once, explicit ack)
 * - Indexing forwarder (change detection + commit boundaries)
 * - Reconciler (removes what a full pass did not confirm)
 * - Search engine plugins (Solr, Elasticsearch)
 *
 * The ledger and status log live in contentsync-storage.
 */

// Public modules
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod job;
pub mod queue;
pub mod reconciler;
pub mod session;
pub mod status_log;
pub mod sync;
pub mod telemetry;

// Re-exports
pub use config::{ConfigError, SiteConfig, SyncConfig};
pub use detector::{ChangeDecision, ChangeDetector, ChangeKind, SiteRegistry};
pub use engine::{EngineFactory, RecordingEngine, SearchEngineClient};
pub use error::{ErrorCategory, Result, SyncError};
pub use forwarder::{append_commit_boundaries, ForwardOutcome, ForwarderPool, IndexingForwarder};
pub use job::{JobAction, JobBatch, JobItem};
pub use queue::{Delivery, DispatchQueue, InMemoryDispatchQueue};
pub use reconciler::{ReconcileReport, Reconciler};
pub use session::{SessionRegistry, SynchronizationSession};
pub use status_log::StatusLogWriter;
pub use sync::{ContentSyncEngine, ContentSyncEngineBuilder, Rejection, SendReceipt};
