//! Shared fixture: in-memory ledger, status log and recording engine
//! behind a started `ContentSyncEngine`.

#![allow(dead_code)]

use contentsync_orchestration::{
    ContentSyncEngine, JobItem, ReconcileReport, RecordingEngine, SiteConfig, SyncConfig,
    SyncError, SynchronizationSession,
};
use contentsync_storage::{IndexingLedger, InMemoryLedger, InMemoryStatusLog, LedgerKey};
use std::sync::Arc;
use std::time::Duration;

pub struct Fixture {
    pub engine: ContentSyncEngine,
    pub ledger: InMemoryLedger,
    pub log: InMemoryStatusLog,
    pub search: RecordingEngine,
}

pub fn config(max_deliveries: u32) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.environment = "live".to_string();
    config.queue.max_deliveries = max_deliveries;
    config.forwarder.workers = 2;
    config.forwarder.drain_timeout_ms = 5_000;
    config.reconcile.batch_size = 2;
    config.sites = vec![
        SiteConfig::new("docs", &["en", "pt"]),
        SiteConfig::new("blog", &[]),
    ];
    config
}

pub async fn fixture() -> Fixture {
    fixture_with(config(3)).await
}

pub async fn fixture_with(config: SyncConfig) -> Fixture {
    let ledger = InMemoryLedger::new();
    let log = InMemoryStatusLog::new();
    let search = RecordingEngine::new();

    let engine = ContentSyncEngine::builder(config)
        .ledger(Arc::new(ledger.clone()))
        .status_sink(Arc::new(log.clone()))
        .engine(Arc::new(search.clone()))
        .build()
        .expect("engine build");
    engine.start().await;

    Fixture {
        engine,
        ledger,
        log,
        search,
    }
}

pub fn page(id: &str, checksum: &str) -> JobItem {
    JobItem::create(id, ["docs"], "en").with_checksum(checksum)
}

pub fn key(id: &str) -> LedgerKey {
    LedgerKey::new(id, "cms", "live", "en")
}

impl Fixture {
    /// Open a full session, send `items` as one batch, finish it
    pub async fn full_pass(&self, items: Vec<JobItem>) -> SynchronizationSession {
        let (session, finished) = self.try_pass(items).await;
        finished.expect("finish");
        session
    }

    /// Like `full_pass`, returning the outcome of finishing
    pub async fn try_pass(
        &self,
        items: Vec<JobItem>,
    ) -> (
        SynchronizationSession,
        Result<Option<ReconcileReport>, SyncError>,
    ) {
        let session = self.engine.begin_session("cms", false).await.expect("begin");
        self.engine.send(&session, items).await.expect("send");
        let finished = self.engine.finish_session(&session).await;
        (session, finished)
    }

    pub async fn drain(&self, session: &SynchronizationSession) {
        self.engine
            .sessions()
            .wait_drained(&session.transaction_id, Duration::from_secs(5))
            .await
            .expect("drain");
    }

    pub async fn ledger_ids(&self) -> Vec<String> {
        self.ledger
            .list_by_source("cms")
            .await
            .expect("list")
            .into_iter()
            .map(|e| e.object_id)
            .collect()
    }
}
