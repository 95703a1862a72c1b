//! Reconciliation
//!
//! After a full session finishes, every ledger entry of the source that the
//! session did not confirm is stale: its content disappeared upstream. The
//! reconciler forwards a DELETE for each stale entry and removes the entry
//! once the engine accepted it. Re-running a pass is safe.

use crate::engine::SearchEngineClient;
use crate::error::Result;
use crate::forwarder::append_commit_boundaries;
use crate::job::JobItem;
use crate::session::SynchronizationSession;
use crate::status_log::StatusLogWriter;
use contentsync_storage::{IndexingLedger, IndexingLedgerEntry, LedgerKey, SyncStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub source: String,
    pub transaction_id: String,
    /// Stale entries found
    pub examined: usize,
    pub deleted: usize,
    /// Stale entries left in place because the pass stopped early
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

pub struct Reconciler {
    ledger: Arc<dyn IndexingLedger>,
    engine: Arc<dyn SearchEngineClient>,
    status: StatusLogWriter,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn IndexingLedger>,
        engine: Arc<dyn SearchEngineClient>,
        status: StatusLogWriter,
        batch_size: usize,
    ) -> Self {
        Self {
            ledger,
            engine,
            status,
            batch_size: batch_size.max(1),
        }
    }

    fn removal(entry: &IndexingLedgerEntry) -> JobItem {
        JobItem::delete(entry.object_id.clone(), entry.sites.clone(), &entry.locale)
            .with_environment(entry.environment.clone())
            .with_checksum(entry.checksum.clone())
    }

    /// Remove what `transaction_id` did not confirm for `source`.
    ///
    /// Stops at the first chunk the engine refuses; the report then counts
    /// the remaining entries as failed. Ledger read/write errors are
    /// returned as errors.
    pub async fn reconcile(&self, source: &str, transaction_id: &str) -> Result<ReconcileReport> {
        let stale = self.ledger.find_stale(source, transaction_id).await?;
        let mut report = ReconcileReport {
            source: source.to_string(),
            transaction_id: transaction_id.to_string(),
            examined: stale.len(),
            ..ReconcileReport::default()
        };

        if stale.is_empty() {
            info!(source = %source, transaction_id = %transaction_id, "Nothing to reconcile");
            return Ok(report);
        }

        info!(
            source = %source,
            transaction_id = %transaction_id,
            stale = stale.len(),
            "Reconciliation started"
        );

        // Records are attributed to the pass that caused the removal
        let session = SynchronizationSession {
            source: source.to_string(),
            transaction_id: transaction_id.to_string(),
            standalone: false,
        };

        for chunk in stale.chunks(self.batch_size) {
            let removals: Vec<JobItem> = chunk.iter().map(Self::removal).collect();
            let augmented = append_commit_boundaries(removals.clone());

            if let Err(e) = self.engine.index(&augmented).await {
                let remaining = report.examined - report.deleted;
                error!(
                    source = %source,
                    deleted = report.deleted,
                    remaining,
                    error = %e,
                    "Reconciliation stopped"
                );
                // Every entry left in place gets a record, not only this chunk
                let unprocessed: Vec<JobItem> =
                    stale[report.deleted..].iter().map(Self::removal).collect();
                self.status
                    .items(&session, &unprocessed, SyncStatus::Error, Some(&e.to_string()))
                    .await;
                report.failed = remaining;
                report.error = Some(e.to_string());
                return Ok(report);
            }

            let keys: Vec<LedgerKey> = chunk.iter().map(IndexingLedgerEntry::key).collect();
            self.ledger.delete_batch(&keys).await?;
            report.deleted += chunk.len();

            self.status
                .items(&session, &removals, SyncStatus::Deindexed, Some("not confirmed by session"))
                .await;
        }

        info!(
            source = %source,
            transaction_id = %transaction_id,
            deleted = report.deleted,
            "Reconciliation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::ScriptedFailure;
    use crate::engine::RecordingEngine;
    use contentsync_storage::{InMemoryLedger, InMemoryStatusLog};

    async fn seeded(entries: &[(&str, &str, bool)]) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for (id, tx, standalone) in entries {
            let entry = IndexingLedgerEntry::new(
                LedgerKey::new(*id, "cms", "live", "en"),
                format!("hash-{}", id),
                *tx,
                vec!["docs".to_string()],
            )
            .with_standalone(*standalone);
            ledger.upsert(&entry).await.unwrap();
        }
        ledger
    }

    fn reconciler(
        ledger: &InMemoryLedger,
        engine: &RecordingEngine,
        log: &InMemoryStatusLog,
        batch_size: usize,
    ) -> Reconciler {
        Reconciler::new(
            Arc::new(ledger.clone()),
            Arc::new(engine.clone()),
            StatusLogWriter::new(Arc::new(log.clone())),
            batch_size,
        )
    }

    #[tokio::test]
    async fn test_removes_only_unconfirmed_entries() {
        let ledger = seeded(&[("a", "t1", false), ("b", "t0", false), ("c", "t0", true)]).await;
        let engine = RecordingEngine::new();
        let log = InMemoryStatusLog::new();

        let report = reconciler(&ledger, &engine, &log, 10)
            .reconcile("cms", "t1")
            .await
            .unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.deleted, 1);
        assert!(report.is_complete());

        let remaining: Vec<String> = ledger
            .list_by_source("cms")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.object_id)
            .collect();
        assert_eq!(remaining, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(log.statuses_for("b"), vec![SyncStatus::Deindexed]);
    }

    #[tokio::test]
    async fn test_chunks_each_end_with_commit() {
        let ledger = seeded(&[("a", "t0", false), ("b", "t0", false), ("c", "t0", false)]).await;
        let engine = RecordingEngine::new();
        let log = InMemoryStatusLog::new();

        let report = reconciler(&ledger, &engine, &log, 2)
            .reconcile("cms", "t1")
            .await
            .unwrap();

        assert_eq!(report.deleted, 3);
        let batches = engine.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert!(batches[0][2].is_commit());
        assert_eq!(batches[1].len(), 2);
        assert!(batches.iter().all(|b| b.last().map(JobItem::is_commit).unwrap_or(false)));
    }

    #[tokio::test]
    async fn test_failure_keeps_entries_and_rerun_is_safe() {
        let ledger = seeded(&[("a", "t0", false), ("b", "t0", false)]).await;
        let engine = RecordingEngine::new();
        let log = InMemoryStatusLog::new();
        let reconciler = reconciler(&ledger, &engine, &log, 1);

        engine.fail_next(ScriptedFailure::Transient, 1);
        let first = reconciler.reconcile("cms", "t1").await.unwrap();
        assert!(!first.is_complete());
        assert_eq!(first.deleted, 0);
        assert_eq!(first.failed, 2);
        assert_eq!(ledger.count("cms").await.unwrap(), 2);
        // The untried second chunk is recorded too
        assert_eq!(log.statuses_for("a"), vec![SyncStatus::Error]);
        assert_eq!(log.statuses_for("b"), vec![SyncStatus::Error]);

        let second = reconciler.reconcile("cms", "t1").await.unwrap();
        assert!(second.is_complete());
        assert_eq!(second.deleted, 2);

        let third = reconciler.reconcile("cms", "t1").await.unwrap();
        assert_eq!(third.examined, 0);
    }

    #[tokio::test]
    async fn test_stop_midway_records_every_remaining_entry() {
        let ledger = seeded(&[("a", "t0", false), ("b", "t0", false), ("c", "t0", false)]).await;
        let engine = RecordingEngine::new();
        let log = InMemoryStatusLog::new();

        // First chunk goes through, then the engine goes away
        engine.pass_next(1);
        engine.fail_next(ScriptedFailure::Transient, 1);
        let report = reconciler(&ledger, &engine, &log, 1)
            .reconcile("cms", "t1")
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(log.statuses_for("a"), vec![SyncStatus::Deindexed]);
        assert_eq!(log.statuses_for("b"), vec![SyncStatus::Error]);
        assert_eq!(log.statuses_for("c"), vec![SyncStatus::Error]);
    }

    #[tokio::test]
    async fn test_other_sources_untouched() {
        let ledger = seeded(&[("a", "t0", false)]).await;
        let engine = RecordingEngine::new();
        let log = InMemoryStatusLog::new();

        let report = reconciler(&ledger, &engine, &log, 10)
            .reconcile("crawler", "t1")
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(engine.calls(), 0);
        assert_eq!(ledger.count("cms").await.unwrap(), 1);
    }
}
