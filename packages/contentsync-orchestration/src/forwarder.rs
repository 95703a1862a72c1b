//! Indexing forwarder
//!
//! Consumes job batches from the dispatch queue:
//!
//! 1. log `RECEIVED_AND_SENT_TO_TURING` for every item
//! 2. run change detection on content items
//! 3. append one COMMIT per distinct (site, locale) after the content
//! 4. forward the augmented batch to the search engine
//! 5. on success, apply ledger effects and log the terminal status
//!
//! A failed forward leaves the ledger untouched. Transient failures are
//! nacked for redelivery until `max_deliveries`; anything else is
//! dead-lettered (`ERROR` per item) and acked.

use crate::detector::{ChangeDecision, ChangeDetector};
use crate::engine::SearchEngineClient;
use crate::error::{Result, SyncError};
use crate::job::{JobBatch, JobItem};
use crate::queue::DispatchQueue;
use crate::session::{SessionRegistry, SynchronizationSession};
use crate::status_log::StatusLogWriter;
use contentsync_storage::{IndexingLedger, IndexingLedgerEntry, LedgerKey, SyncStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// COMMIT markers for every distinct (site, locale) in `items`: targets of
/// content items first, in first-seen order, then targets only named by
/// producer COMMITs
pub fn commit_boundaries(items: &[JobItem]) -> Vec<JobItem> {
    let mut seen = HashSet::new();
    let mut commits = Vec::new();
    let content = items.iter().filter(|item| !item.is_commit());
    let markers = items.iter().filter(|item| item.is_commit());
    for item in content.chain(markers) {
        for (site, locale) in item.site_locale_pairs() {
            if seen.insert((site.clone(), locale.clone())) {
                commits.push(JobItem::commit([site], &locale).with_environment(item.environment.clone()));
            }
        }
    }
    commits
}

/// Content items first, then exactly one COMMIT per distinct (site, locale).
/// Producer COMMIT markers are folded into the trailing set.
pub fn append_commit_boundaries(items: Vec<JobItem>) -> Vec<JobItem> {
    let commits = commit_boundaries(&items);
    let mut augmented: Vec<JobItem> = items.into_iter().filter(|item| !item.is_commit()).collect();
    augmented.extend(commits);
    augmented
}

/// Counts for one processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub indexed: usize,
    pub deindexed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub commits: usize,
}

impl ForwardOutcome {
    pub fn forwarded(&self) -> usize {
        self.indexed + self.deindexed
    }
}

/// Ledger effect to apply once the engine accepted the batch
enum LedgerEffect {
    Upsert {
        item: JobItem,
        entry: IndexingLedgerEntry,
    },
    /// Sites an updated object no longer targets
    DropSites {
        item: JobItem,
    },
    Remove {
        item: JobItem,
        key: LedgerKey,
    },
    /// DELETE of some sites; the entry keeps the others
    Narrow {
        item: JobItem,
        entry: IndexingLedgerEntry,
    },
    Confirm {
        item: JobItem,
        previous: IndexingLedgerEntry,
    },
}

pub struct IndexingForwarder {
    detector: ChangeDetector,
    ledger: Arc<dyn IndexingLedger>,
    engine: Arc<dyn SearchEngineClient>,
    status: StatusLogWriter,
}

impl IndexingForwarder {
    pub fn new(
        detector: ChangeDetector,
        ledger: Arc<dyn IndexingLedger>,
        engine: Arc<dyn SearchEngineClient>,
        status: StatusLogWriter,
    ) -> Self {
        Self {
            detector,
            ledger,
            engine,
            status,
        }
    }

    /// Handle one delivered batch
    pub async fn process(&self, batch: &JobBatch) -> Result<ForwardOutcome> {
        let session = &batch.session;
        info!(
            batch_id = %batch.batch_id,
            session = %session,
            items = batch.items.len(),
            attempt = batch.attempt,
            "Batch received"
        );

        self.status
            .items(session, &batch.items, SyncStatus::Received, None)
            .await;

        let mut outcome = ForwardOutcome::default();
        let mut forward: Vec<JobItem> = Vec::new();
        let mut effects: Vec<LedgerEffect> = Vec::new();

        for item in &batch.items {
            if item.is_commit() {
                let resolution = self.detector.sites().resolve(item);
                if resolution.accepted.is_empty() {
                    outcome.ignored += 1;
                    self.status
                        .item(session, item, SyncStatus::Ignored, Some("no configured site for COMMIT"))
                        .await;
                    continue;
                }
                let mut commit = item.clone();
                commit.site_names = resolution.accepted;
                forward.push(commit);
                continue;
            }

            match self.detector.decide(session, item).await? {
                ChangeDecision::Error { reason } => {
                    warn!(
                        object_id = item.object_id().unwrap_or("-"),
                        reason = %reason,
                        "Item ignored"
                    );
                    outcome.ignored += 1;
                    self.status
                        .item(session, item, SyncStatus::Ignored, Some(&reason))
                        .await;
                }
                ChangeDecision::Skip { previous } => {
                    let mut skipped = item.clone();
                    skipped.checksum = Some(previous.checksum.clone());
                    effects.push(LedgerEffect::Confirm {
                        item: skipped,
                        previous,
                    });
                }
                ChangeDecision::Create {
                    key,
                    sites,
                    checksum,
                } => {
                    let upsert = Self::targeted(item, sites.clone(), Some(checksum.clone()));
                    let entry = ChangeDetector::indexed_entry(session, key, sites, checksum, None);
                    forward.push(upsert.clone());
                    effects.push(LedgerEffect::Upsert { item: upsert, entry });
                }
                ChangeDecision::Update {
                    key,
                    sites,
                    checksum,
                    previous,
                    dropped_sites,
                } => {
                    let upsert = Self::targeted(item, sites.clone(), Some(checksum.clone()));
                    let entry =
                        ChangeDetector::indexed_entry(session, key, sites, checksum, Some(&previous));
                    forward.push(upsert.clone());
                    effects.push(LedgerEffect::Upsert { item: upsert, entry });

                    if !dropped_sites.is_empty() {
                        let mut removal = JobItem::delete(
                            previous.object_id.clone(),
                            dropped_sites,
                            &previous.locale,
                        )
                        .with_environment(previous.environment.clone());
                        removal.checksum = Some(previous.checksum.clone());
                        forward.push(removal.clone());
                        effects.push(LedgerEffect::DropSites { item: removal });
                    }
                }
                ChangeDecision::Delete {
                    key,
                    sites,
                    previous,
                    remaining_sites,
                } => {
                    let checksum = previous
                        .as_ref()
                        .map(|p| p.checksum.clone())
                        .or_else(|| item.checksum.clone());
                    let removal = Self::targeted(item, sites, checksum);
                    forward.push(removal.clone());
                    match previous {
                        Some(previous) if !remaining_sites.is_empty() => {
                            let entry = ChangeDetector::narrowed_entry(&previous, remaining_sites);
                            effects.push(LedgerEffect::Narrow { item: removal, entry });
                        }
                        _ => effects.push(LedgerEffect::Remove { item: removal, key }),
                    }
                }
            }
        }

        if !forward.is_empty() {
            let augmented = append_commit_boundaries(forward);
            outcome.commits = augmented.iter().filter(|item| item.is_commit()).count();

            if let Err(e) = self.engine.index(&augmented).await {
                error!(
                    batch_id = %batch.batch_id,
                    engine = self.engine.engine_type(),
                    error = %e,
                    category = %e.category(),
                    "Forward failed"
                );
                return Err(e);
            }
            debug!(batch_id = %batch.batch_id, items = augmented.len(), "Batch forwarded");
        }

        for effect in effects {
            self.apply(session, effect, &mut outcome).await?;
        }

        info!(
            batch_id = %batch.batch_id,
            indexed = outcome.indexed,
            deindexed = outcome.deindexed,
            skipped = outcome.skipped,
            ignored = outcome.ignored,
            commits = outcome.commits,
            "Batch processed"
        );
        Ok(outcome)
    }

    fn targeted(item: &JobItem, sites: Vec<String>, checksum: Option<String>) -> JobItem {
        let mut targeted = item.clone();
        targeted.site_names = sites;
        targeted.checksum = checksum;
        targeted
    }

    async fn apply(
        &self,
        session: &SynchronizationSession,
        effect: LedgerEffect,
        outcome: &mut ForwardOutcome,
    ) -> Result<()> {
        match effect {
            LedgerEffect::Upsert { item, entry } => {
                self.ledger.upsert(&entry).await?;
                outcome.indexed += 1;
                self.status.item(session, &item, SyncStatus::Indexed, None).await;
            }
            LedgerEffect::DropSites { item } => {
                outcome.deindexed += 1;
                self.status
                    .item(session, &item, SyncStatus::Deindexed, Some("site no longer targeted"))
                    .await;
            }
            LedgerEffect::Remove { item, key } => {
                self.ledger.delete(&key).await?;
                outcome.deindexed += 1;
                self.status.item(session, &item, SyncStatus::Deindexed, None).await;
            }
            LedgerEffect::Narrow { item, entry } => {
                self.ledger.upsert(&entry).await?;
                outcome.deindexed += 1;
                self.status.item(session, &item, SyncStatus::Deindexed, None).await;
            }
            LedgerEffect::Confirm { item, previous } => {
                self.detector.confirm_unchanged(session, &previous).await?;
                outcome.skipped += 1;
                self.status.item(session, &item, SyncStatus::Skipped, None).await;
            }
        }
        Ok(())
    }

    /// Give up on a batch: `ERROR` per item, no ledger change
    pub async fn dead_letter(&self, batch: &JobBatch, reason: &str) {
        error!(
            batch_id = %batch.batch_id,
            attempt = batch.attempt,
            reason = %reason,
            "Batch dead-lettered"
        );
        self.status
            .items(&batch.session, &batch.items, SyncStatus::Error, Some(reason))
            .await;
    }
}

/// What a worker does with a failed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Redeliver,
    DeadLetter,
}

pub fn failure_action(error: &SyncError, attempt: u32, max_deliveries: u32) -> FailureAction {
    if error.is_transient() && attempt < max_deliveries {
        FailureAction::Redeliver
    } else {
        FailureAction::DeadLetter
    }
}

/// N consumer loops over one queue
pub struct ForwarderPool {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ForwarderPool {
    pub fn spawn(
        workers: usize,
        queue: Arc<dyn DispatchQueue>,
        forwarder: Arc<IndexingForwarder>,
        sessions: Arc<SessionRegistry>,
        max_deliveries: u32,
    ) -> Self {
        let token = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    queue: queue.clone(),
                    forwarder: forwarder.clone(),
                    sessions: sessions.clone(),
                    max_deliveries,
                    token: token.child_token(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers = workers.max(1), queue = queue.name(), "Forwarder pool started");
        Self { token, handles }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Stop all workers; an in-progress batch is dropped unsettled and
    /// therefore redelivered
    pub async fn shutdown(self) {
        self.token.cancel();
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Forwarder worker ended abnormally");
            }
        }
        info!("Forwarder pool stopped");
    }
}

struct Worker {
    id: usize,
    queue: Arc<dyn DispatchQueue>,
    forwarder: Arc<IndexingForwarder>,
    sessions: Arc<SessionRegistry>,
    max_deliveries: u32,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Forwarder worker started");
        loop {
            let received = tokio::select! {
                _ = self.token.cancelled() => break,
                received = self.queue.receive() => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Queue receive failed");
                    break;
                }
            };

            let batch = delivery.batch().clone();
            let result = tokio::select! {
                _ = self.token.cancelled() => break,
                result = self.forwarder.process(&batch) => result,
            };

            match result {
                Ok(_) => {
                    delivery.ack();
                    self.sessions.batch_settled(&batch.session.transaction_id);
                }
                Err(e) => match failure_action(&e, batch.attempt, self.max_deliveries) {
                    FailureAction::Redeliver => {
                        warn!(
                            worker = self.id,
                            batch_id = %batch.batch_id,
                            attempt = batch.attempt,
                            error = %e,
                            "Transient failure, redelivering"
                        );
                        delivery.nack(true);
                    }
                    FailureAction::DeadLetter => {
                        self.forwarder.dead_letter(&batch, &e.to_string()).await;
                        delivery.ack();
                        self.sessions
                            .batch_dead_lettered(&batch.session.transaction_id);
                    }
                },
            }
        }
        debug!(worker = self.id, "Forwarder worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::detector::SiteRegistry;
    use crate::engine::memory::ScriptedFailure;
    use crate::engine::RecordingEngine;
    use contentsync_storage::{InMemoryLedger, InMemoryStatusLog};

    struct Harness {
        ledger: InMemoryLedger,
        log: InMemoryStatusLog,
        engine: RecordingEngine,
        forwarder: IndexingForwarder,
    }

    fn harness() -> Harness {
        let ledger = InMemoryLedger::new();
        let log = InMemoryStatusLog::new();
        let engine = RecordingEngine::new();
        let ledger_port: Arc<dyn IndexingLedger> = Arc::new(ledger.clone());
        let detector = ChangeDetector::new(
            ledger_port.clone(),
            SiteRegistry::new(&[SiteConfig::new("docs", &[]), SiteConfig::new("blog", &[])]),
        );
        let forwarder = IndexingForwarder::new(
            detector,
            ledger_port,
            Arc::new(engine.clone()),
            StatusLogWriter::new(Arc::new(log.clone())),
        );
        Harness {
            ledger,
            log,
            engine,
            forwarder,
        }
    }

    fn create(id: &str, checksum: &str) -> JobItem {
        JobItem::create(id, ["docs"], "en")
            .with_environment("live")
            .with_checksum(checksum)
    }

    #[test]
    fn test_commit_boundaries_dedup_and_order() {
        let items = vec![
            JobItem::create("p1", ["docs", "blog"], "en"),
            JobItem::create("p2", ["docs"], "pt"),
            JobItem::commit(["docs"], "en"),
            JobItem::delete("p3", ["blog"], "en"),
        ];

        let augmented = append_commit_boundaries(items);
        let commits: Vec<(String, String)> = augmented
            .iter()
            .filter(|i| i.is_commit())
            .map(|i| (i.site_names[0].clone(), i.locale.clone()))
            .collect();

        assert_eq!(augmented.len(), 6);
        assert!(augmented[..3].iter().all(|i| !i.is_commit()));
        assert_eq!(
            commits,
            vec![
                ("docs".to_string(), "en".to_string()),
                ("blog".to_string(), "en".to_string()),
                ("docs".to_string(), "pt".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_then_resend_skips() {
        let h = harness();
        let session = SynchronizationSession::full("cms");
        let batch = JobBatch::new(session.clone(), vec![create("p1", "h1")]);

        let first = h.forwarder.process(&batch).await.unwrap();
        assert_eq!(first.indexed, 1);
        assert_eq!(first.commits, 1);

        let second = h.forwarder.process(&batch).await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.forwarded(), 0);

        assert_eq!(h.engine.batches().len(), 1);
        assert_eq!(
            h.log.statuses_for("p1"),
            vec![
                SyncStatus::Received,
                SyncStatus::Indexed,
                SyncStatus::Received,
                SyncStatus::Skipped
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_forward_leaves_ledger_untouched() {
        let h = harness();
        let session = SynchronizationSession::full("cms");
        h.engine.fail_next(ScriptedFailure::Transient, 1);

        let batch = JobBatch::new(session.clone(), vec![create("p1", "h1")]);
        let err = h.forwarder.process(&batch).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.ledger.count("cms").await.unwrap(), 0);
        assert_eq!(h.log.count_status(SyncStatus::Indexed), 0);
    }

    #[tokio::test]
    async fn test_unknown_site_is_ignored_with_reason() {
        let h = harness();
        let session = SynchronizationSession::full("cms");
        let item = JobItem::create("p1", ["shop"], "en").with_checksum("h1");

        let outcome = h
            .forwarder
            .process(&JobBatch::new(session, vec![item]))
            .await
            .unwrap();

        assert_eq!(outcome.ignored, 1);
        assert_eq!(h.engine.calls(), 0);
        let records = h.log.records_for("p1");
        assert_eq!(records.last().unwrap().status, SyncStatus::Ignored);
        assert!(records.last().unwrap().reason.as_deref().unwrap().contains("shop"));
    }

    #[tokio::test]
    async fn test_delete_removes_entry_after_forward() {
        let h = harness();
        let session = SynchronizationSession::full("cms");
        h.forwarder
            .process(&JobBatch::new(session.clone(), vec![create("p1", "h1")]))
            .await
            .unwrap();

        let delete = JobItem::delete("p1", ["docs"], "en").with_environment("live");
        let outcome = h
            .forwarder
            .process(&JobBatch::new(session, vec![delete]))
            .await
            .unwrap();

        assert_eq!(outcome.deindexed, 1);
        assert_eq!(h.ledger.count("cms").await.unwrap(), 0);
        assert!(!h.engine.contains("docs", "en", "p1"));
        assert_eq!(h.log.statuses_for("p1").last(), Some(&SyncStatus::Deindexed));
    }

    #[tokio::test]
    async fn test_site_narrowing_deletes_dropped_site() {
        let h = harness();
        let session = SynchronizationSession::full("cms");
        let wide = JobItem::create("p1", ["docs", "blog"], "en")
            .with_environment("live")
            .with_checksum("h1");
        h.forwarder
            .process(&JobBatch::new(session.clone(), vec![wide]))
            .await
            .unwrap();
        assert!(h.engine.contains("blog", "en", "p1"));

        let outcome = h
            .forwarder
            .process(&JobBatch::new(session, vec![create("p1", "h1")]))
            .await
            .unwrap();

        assert_eq!(outcome.indexed, 1);
        assert_eq!(outcome.deindexed, 1);
        assert!(h.engine.contains("docs", "en", "p1"));
        assert!(!h.engine.contains("blog", "en", "p1"));

        let key = LedgerKey::new("p1", "cms", "live", "en");
        let entry = h.ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.sites, vec!["docs".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_of_some_sites_keeps_the_rest() {
        let h = harness();
        let full = SynchronizationSession::full("cms");
        let wide = JobItem::create("p1", ["docs", "blog"], "en")
            .with_environment("live")
            .with_checksum("h1");
        h.forwarder
            .process(&JobBatch::new(full.clone(), vec![wide]))
            .await
            .unwrap();

        let delete = JobItem::delete("p1", ["docs"], "en").with_environment("live");
        let outcome = h
            .forwarder
            .process(&JobBatch::new(SynchronizationSession::standalone("cms"), vec![delete]))
            .await
            .unwrap();

        assert_eq!(outcome.deindexed, 1);
        assert!(!h.engine.contains("docs", "en", "p1"));
        assert!(h.engine.contains("blog", "en", "p1"));

        let key = LedgerKey::new("p1", "cms", "live", "en");
        let entry = h.ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.sites, vec!["blog".to_string()]);
        assert_eq!(entry.transaction_id, full.transaction_id);

        // The surviving copy is still reconcilable
        let stale = h.ledger.find_stale("cms", "later-pass").await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_logs_error_per_item() {
        let h = harness();
        let batch = JobBatch::new(
            SynchronizationSession::full("cms"),
            vec![create("p1", "h1"), JobItem::commit(["docs"], "en")],
        );

        h.forwarder.dead_letter(&batch, "engine rejected").await;

        assert_eq!(h.log.count_status(SyncStatus::Error), 2);
        assert_eq!(
            h.log.records_for("p1")[0].reason.as_deref(),
            Some("engine rejected")
        );
    }

    #[test]
    fn test_failure_action() {
        let transient = SyncError::EngineUnavailable("down".into());
        let permanent = SyncError::EngineRejected {
            status: 400,
            message: "bad".into(),
        };

        assert_eq!(failure_action(&transient, 1, 3), FailureAction::Redeliver);
        assert_eq!(failure_action(&transient, 3, 3), FailureAction::DeadLetter);
        assert_eq!(failure_action(&permanent, 1, 3), FailureAction::DeadLetter);
    }
}
