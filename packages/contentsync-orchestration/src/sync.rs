//! Content synchronization engine
//!
//! Ties the pieces together: producers open a session, `send` job items
//! (validated and enqueued, never indexed inline), and `finish_session`
//! once they are done. Finishing waits for the session's batches to drain
//! and, for full sessions, reconciles the source.
//!
//! The ledger keeps the latest full pass of every source. A pass that timed
//! out, was abandoned or lost a batch to the dead letter path is marked
//! incomplete and is never reconciled; only the latest pass, once drained,
//! may be.

use crate::config::SyncConfig;
use crate::detector::{ChangeDetector, SiteRegistry};
use crate::engine::{EngineFactory, SearchEngineClient};
use crate::error::{Result, SyncError};
use crate::forwarder::{ForwarderPool, IndexingForwarder};
use crate::job::{JobBatch, JobItem};
use crate::queue::{DispatchQueue, InMemoryDispatchQueue};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::session::{SessionRegistry, SynchronizationSession};
use crate::status_log::StatusLogWriter;
use contentsync_storage::{
    InMemoryLedger, InMemoryStatusLog, IndexingLedger, PassState, SourcePass, StatusLogSink,
    SyncStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// An item refused at ingress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Position in the submitted list
    pub index: usize,
    pub object_id: Option<String>,
    pub reason: String,
}

/// What the producer learns from `send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    /// None when nothing was accepted
    pub batch_id: Option<Uuid>,
    pub accepted: usize,
    pub rejected: Vec<Rejection>,
}

impl SendReceipt {
    pub fn all_accepted(&self) -> bool {
        self.rejected.is_empty()
    }
}

pub struct ContentSyncEngine {
    config: SyncConfig,
    ledger: Arc<dyn IndexingLedger>,
    status: StatusLogWriter,
    engine: Arc<dyn SearchEngineClient>,
    queue: Arc<dyn DispatchQueue>,
    sessions: Arc<SessionRegistry>,
    forwarder: Arc<IndexingForwarder>,
    reconciler: Reconciler,
    pool: tokio::sync::Mutex<Option<ForwarderPool>>,
}

pub struct ContentSyncEngineBuilder {
    config: SyncConfig,
    ledger: Option<Arc<dyn IndexingLedger>>,
    status_sink: Option<Arc<dyn StatusLogSink>>,
    engine: Option<Arc<dyn SearchEngineClient>>,
    queue: Option<Arc<dyn DispatchQueue>>,
    factory: Option<EngineFactory>,
}

impl ContentSyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            ledger: None,
            status_sink: None,
            engine: None,
            queue: None,
            factory: None,
        }
    }

    pub fn ledger(mut self, ledger: Arc<dyn IndexingLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn status_sink(mut self, sink: Arc<dyn StatusLogSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Use this client instead of building one from `config.engine`
    pub fn engine(mut self, engine: Arc<dyn SearchEngineClient>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn DispatchQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn factory(mut self, factory: EngineFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<ContentSyncEngine> {
        self.config.validate()?;

        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new()) as Arc<dyn IndexingLedger>);
        let sink = self
            .status_sink
            .unwrap_or_else(|| Arc::new(InMemoryStatusLog::new()) as Arc<dyn StatusLogSink>);
        let engine = match self.engine {
            Some(engine) => engine,
            None => self
                .factory
                .unwrap_or_default()
                .build(&self.config.engine)?,
        };
        let queue_name = self.config.queue.name.clone();
        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(InMemoryDispatchQueue::new(queue_name)) as Arc<dyn DispatchQueue>
        });

        let status = StatusLogWriter::new(sink);
        let detector = ChangeDetector::new(ledger.clone(), SiteRegistry::new(&self.config.sites));
        let forwarder = Arc::new(IndexingForwarder::new(
            detector,
            ledger.clone(),
            engine.clone(),
            status.clone(),
        ));
        let reconciler = Reconciler::new(
            ledger.clone(),
            engine.clone(),
            status.clone(),
            self.config.reconcile.batch_size,
        );

        Ok(ContentSyncEngine {
            config: self.config,
            ledger,
            status,
            engine,
            queue,
            sessions: Arc::new(SessionRegistry::new()),
            forwarder,
            reconciler,
            pool: tokio::sync::Mutex::new(None),
        })
    }
}

impl ContentSyncEngine {
    pub fn builder(config: SyncConfig) -> ContentSyncEngineBuilder {
        ContentSyncEngineBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn IndexingLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &Arc<dyn SearchEngineClient> {
        &self.engine
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Status records lost to sink failures
    pub fn status_failures(&self) -> u64 {
        self.status.failures()
    }

    /// Start the forwarder workers. Calling twice is a no-op.
    pub async fn start(&self) {
        let mut pool = self.pool.lock().await;
        if pool.is_none() {
            *pool = Some(ForwarderPool::spawn(
                self.config.forwarder.workers,
                self.queue.clone(),
                self.forwarder.clone(),
                self.sessions.clone(),
                self.config.queue.max_deliveries,
            ));
        }
    }

    /// Stop the workers and close the queue
    pub async fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.shutdown().await;
        }
        self.queue.close();
    }

    /// Open a session. A full session becomes the source's latest pass.
    pub async fn begin_session(
        &self,
        source: &str,
        standalone: bool,
    ) -> Result<SynchronizationSession> {
        let session = self.sessions.begin(source, standalone)?;
        if !standalone {
            if let Err(e) = self.record_pass(&session, PassState::Open).await {
                self.sessions.release(&session);
                return Err(e);
            }
        }
        Ok(session)
    }

    async fn record_pass(&self, session: &SynchronizationSession, state: PassState) -> Result<()> {
        let pass = SourcePass::new(&session.source, &session.transaction_id, state);
        self.ledger.record_pass(&pass).await?;
        Ok(())
    }

    async fn mark_incomplete(&self, session: &SynchronizationSession) {
        if session.standalone {
            return;
        }
        if let Err(e) = self.record_pass(session, PassState::Incomplete).await {
            warn!(session = %session, error = %e, "Could not mark pass incomplete");
        }
    }

    /// Validate and enqueue items; returns as soon as the batch is queued
    pub async fn send(
        &self,
        session: &SynchronizationSession,
        items: Vec<JobItem>,
    ) -> Result<SendReceipt> {
        if !self.sessions.is_open(session) {
            return Err(SyncError::SessionNotOpen(session.to_string()));
        }

        let mut accepted = Vec::with_capacity(items.len());
        let mut rejected = Vec::new();

        for (index, mut item) in items.into_iter().enumerate() {
            if item.environment.is_empty() {
                item.environment = self.config.environment.clone();
            }
            match item.validate() {
                Ok(()) => accepted.push(item),
                Err(e) => {
                    let reason = e.to_string();
                    warn!(
                        session = %session,
                        index,
                        object_id = item.object_id().unwrap_or("-"),
                        reason = %reason,
                        "Item rejected at ingress"
                    );
                    self.status
                        .item(session, &item, SyncStatus::Error, Some(&reason))
                        .await;
                    rejected.push(Rejection {
                        index,
                        object_id: item.object_id.clone(),
                        reason,
                    });
                }
            }
        }

        if accepted.is_empty() {
            return Ok(SendReceipt {
                batch_id: None,
                accepted: 0,
                rejected,
            });
        }

        let batch = JobBatch::new(session.clone(), accepted);
        // Logged before publishing so the record precedes anything a worker writes
        self.status
            .items(session, &batch.items, SyncStatus::SentToQueue, None)
            .await;

        self.sessions.batch_published(&session.transaction_id);
        if let Err(e) = self.queue.publish(&batch).await {
            self.sessions.batch_settled(&session.transaction_id);
            self.status
                .items(session, &batch.items, SyncStatus::Error, Some(&e.to_string()))
                .await;
            return Err(e);
        }

        info!(
            session = %session,
            batch_id = %batch.batch_id,
            accepted = batch.items.len(),
            rejected = rejected.len(),
            "Items sent to queue"
        );

        Ok(SendReceipt {
            batch_id: Some(batch.batch_id),
            accepted: batch.items.len(),
            rejected,
        })
    }

    /// Close a session: wait for its batches, reconcile if full.
    ///
    /// Returns the reconciliation report for full sessions. A session with a
    /// dead-lettered batch fails with `SessionIncomplete` and is not
    /// reconciled. The source lock is released whatever the outcome.
    pub async fn finish_session(
        &self,
        session: &SynchronizationSession,
    ) -> Result<Option<ReconcileReport>> {
        let result = self.drain_and_reconcile(session).await;
        self.sessions.release(session);
        result
    }

    async fn drain_and_reconcile(
        &self,
        session: &SynchronizationSession,
    ) -> Result<Option<ReconcileReport>> {
        let timeout = Duration::from_millis(self.config.forwarder.drain_timeout_ms);
        if let Err(e) = self
            .sessions
            .wait_drained(&session.transaction_id, timeout)
            .await
        {
            self.mark_incomplete(session).await;
            return Err(e);
        }

        // Unchanged items of a lost batch were never confirmed
        let dead_lettered = self.sessions.dead_lettered(&session.transaction_id);
        if dead_lettered > 0 {
            error!(session = %session, dead_lettered, "Session incomplete, not reconciling");
            self.mark_incomplete(session).await;
            return Err(SyncError::SessionIncomplete {
                transaction_id: session.transaction_id.clone(),
                dead_lettered,
            });
        }

        if session.standalone {
            info!(session = %session, "Standalone session finished");
            return Ok(None);
        }

        self.record_pass(session, PassState::Drained).await?;
        let report = self
            .reconciler
            .reconcile(&session.source, &session.transaction_id)
            .await?;
        if !report.is_complete() {
            return Err(SyncError::Reconciliation {
                source_name: session.source.clone(),
                transaction_id: session.transaction_id.clone(),
                deleted: report.deleted,
                message: report.error.clone().unwrap_or_default(),
            });
        }

        info!(session = %session, deleted = report.deleted, "Full session finished");
        Ok(Some(report))
    }

    /// Close without reconciling (producer gave up)
    pub async fn abandon_session(&self, session: &SynchronizationSession) {
        warn!(session = %session, "Session abandoned, no reconciliation");
        self.mark_incomplete(session).await;
        self.sessions.release(session);
    }

    /// Re-index a few objects outside any full pass
    pub async fn reindex(&self, source: &str, items: Vec<JobItem>) -> Result<SendReceipt> {
        let session = self.begin_session(source, true).await?;
        let receipt = match self.send(&session, items).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.sessions.release(&session);
                return Err(e);
            }
        };
        self.finish_session(&session).await?;
        Ok(receipt)
    }

    /// Re-run reconciliation for the source's latest full pass.
    ///
    /// Refused while a full session of the source is open, and for any
    /// transaction other than the latest pass once it drained.
    pub async fn reconcile(&self, source: &str, transaction_id: &str) -> Result<ReconcileReport> {
        self.sessions.claim_source(source, transaction_id)?;
        let result = self.reconcile_latest(source, transaction_id).await;
        self.sessions.release_source(source, transaction_id);
        result
    }

    async fn reconcile_latest(&self, source: &str, transaction_id: &str) -> Result<ReconcileReport> {
        let refuse = |reason: String| SyncError::NotReconcilable {
            source_name: source.to_string(),
            transaction_id: transaction_id.to_string(),
            reason,
        };

        match self.ledger.latest_pass(source).await? {
            Some(pass) if pass.allows_reconcile(transaction_id) => {}
            Some(pass) if pass.transaction_id != transaction_id => {
                return Err(refuse(format!("latest full pass is {}", pass.transaction_id)));
            }
            Some(pass) => return Err(refuse(format!("pass is {}", pass.state))),
            None => return Err(refuse("no full pass recorded".to_string())),
        }

        self.reconciler.reconcile(source, transaction_id).await
    }
}
