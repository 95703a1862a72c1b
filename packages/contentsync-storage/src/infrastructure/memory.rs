//! In-memory ledger and status log
//!
//! HashMap/Vec-backed implementations for tests and dry runs.
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::models::{
    IndexingLedgerEntry, LedgerKey, SourcePass, StatusLogRecord, SyncStatus,
};
use crate::domain::ports::{IndexingLedger, StatusLogSink};
use crate::error::Result;

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    entries: Arc<RwLock<HashMap<LedgerKey, IndexingLedgerEntry>>>,
    passes: Arc<RwLock<HashMap<String, SourcePass>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut entries: Vec<IndexingLedgerEntry>) -> Vec<IndexingLedgerEntry> {
    entries.sort_by(|a, b| {
        (&a.object_id, &a.environment, &a.locale).cmp(&(&b.object_id, &b.environment, &b.locale))
    });
    entries
}

#[async_trait]
impl IndexingLedger for InMemoryLedger {
    async fn get(&self, key: &LedgerKey) -> Result<Option<IndexingLedgerEntry>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn upsert(&self, entry: &IndexingLedgerEntry) -> Result<()> {
        self.entries.write().insert(entry.key(), entry.clone());
        Ok(())
    }

    async fn touch_transaction(&self, key: &LedgerKey, transaction_id: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.transaction_id = transaction_id.to_string();
                entry.standalone = false;
                entry.status = SyncStatus::Skipped;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &LedgerKey) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn delete_batch(&self, keys: &[LedgerKey]) -> Result<usize> {
        let mut entries = self.entries.write();
        Ok(keys.iter().filter(|k| entries.remove(k).is_some()).count())
    }

    async fn find_stale(
        &self,
        source: &str,
        transaction_id: &str,
    ) -> Result<Vec<IndexingLedgerEntry>> {
        let stale = self
            .entries
            .read()
            .values()
            .filter(|e| e.source == source && e.transaction_id != transaction_id && !e.standalone)
            .cloned()
            .collect();
        Ok(sorted(stale))
    }

    async fn list_by_source(&self, source: &str) -> Result<Vec<IndexingLedgerEntry>> {
        let entries = self
            .entries
            .read()
            .values()
            .filter(|e| e.source == source)
            .cloned()
            .collect();
        Ok(sorted(entries))
    }

    async fn count(&self, source: &str) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.source == source)
            .count())
    }

    async fn record_pass(&self, pass: &SourcePass) -> Result<()> {
        self.passes.write().insert(pass.source.clone(), pass.clone());
        Ok(())
    }

    async fn latest_pass(&self, source: &str) -> Result<Option<SourcePass>> {
        Ok(self.passes.read().get(source).cloned())
    }
}

/// Append-only in-memory status log, queryable for tests and tooling
#[derive(Clone, Default)]
pub struct InMemoryStatusLog {
    records: Arc<RwLock<Vec<StatusLogRecord>>>,
}

impl InMemoryStatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StatusLogRecord> {
        self.records.read().clone()
    }

    pub fn records_for(&self, object_id: &str) -> Vec<StatusLogRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.object_id.as_deref() == Some(object_id))
            .cloned()
            .collect()
    }

    /// Statuses recorded for an object, in append order
    pub fn statuses_for(&self, object_id: &str) -> Vec<SyncStatus> {
        self.records_for(object_id)
            .into_iter()
            .map(|r| r.status)
            .collect()
    }

    pub fn count_status(&self, status: SyncStatus) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl StatusLogSink for InMemoryStatusLog {
    async fn append(&self, record: &StatusLogRecord) -> Result<()> {
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn append_all(&self, records: &[StatusLogRecord]) -> Result<()> {
        self.records.write().extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(object_id: &str, tx: &str) -> IndexingLedgerEntry {
        IndexingLedgerEntry::new(
            LedgerKey::new(object_id, "docs", "live", "en"),
            format!("hash-{}", object_id),
            tx,
            vec!["docs".to_string()],
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let ledger = InMemoryLedger::new();
        let e = entry("a", "t0");
        ledger.upsert(&e).await.unwrap();

        assert_eq!(ledger.get(&e.key()).await.unwrap(), Some(e.clone()));
        assert_eq!(ledger.count("docs").await.unwrap(), 1);
        assert_eq!(ledger.count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_touch_keeps_modified_at_and_checksum() {
        let ledger = InMemoryLedger::new();
        let e = entry("a", "t0").with_standalone(true);
        ledger.upsert(&e).await.unwrap();

        assert!(ledger.touch_transaction(&e.key(), "t1").await.unwrap());

        let touched = ledger.get(&e.key()).await.unwrap().unwrap();
        assert_eq!(touched.transaction_id, "t1");
        assert_eq!(touched.modified_at, e.modified_at);
        assert_eq!(touched.checksum, e.checksum);
        assert!(!touched.standalone);

        let missing = LedgerKey::new("zz", "docs", "live", "en");
        assert!(!ledger.touch_transaction(&missing, "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_stale_excludes_current_and_standalone() {
        let ledger = InMemoryLedger::new();
        ledger.upsert(&entry("a", "t1")).await.unwrap();
        ledger.upsert(&entry("b", "t0")).await.unwrap();
        ledger
            .upsert(&entry("c", "t0").with_standalone(true))
            .await
            .unwrap();

        let stale = ledger.find_stale("docs", "t1").await.unwrap();
        let ids: Vec<_> = stale.iter().map(|e| e.object_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let e = entry("a", "t0");
        ledger.upsert(&e).await.unwrap();

        assert!(ledger.delete(&e.key()).await.unwrap());
        assert!(!ledger.delete(&e.key()).await.unwrap());
        assert_eq!(ledger.delete_batch(&[e.key()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_latest_pass_is_replaced_per_source() {
        use crate::domain::models::PassState;

        let ledger = InMemoryLedger::new();
        assert!(ledger.latest_pass("docs").await.unwrap().is_none());

        ledger
            .record_pass(&SourcePass::new("docs", "t1", PassState::Drained))
            .await
            .unwrap();
        ledger
            .record_pass(&SourcePass::new("docs", "t2", PassState::Open))
            .await
            .unwrap();
        ledger
            .record_pass(&SourcePass::new("blog", "t9", PassState::Drained))
            .await
            .unwrap();

        let latest = ledger.latest_pass("docs").await.unwrap().unwrap();
        assert_eq!(latest.transaction_id, "t2");
        assert_eq!(latest.state, PassState::Open);
    }

    #[tokio::test]
    async fn test_status_log_queries() {
        let log = InMemoryStatusLog::new();
        log.append(&StatusLogRecord::new("docs", "t", "CREATE", SyncStatus::SentToQueue).with_object("p1"))
            .await
            .unwrap();
        log.append(&StatusLogRecord::new("docs", "t", "CREATE", SyncStatus::Indexed).with_object("p1"))
            .await
            .unwrap();
        log.append(&StatusLogRecord::new("docs", "t", "COMMIT", SyncStatus::Received))
            .await
            .unwrap();

        assert_eq!(
            log.statuses_for("p1"),
            vec![SyncStatus::SentToQueue, SyncStatus::Indexed]
        );
        assert_eq!(log.count_status(SyncStatus::Received), 1);
        assert_eq!(log.len(), 3);
    }
}
