//! Lookup cache in front of any ledger
//!
//! Only `get` is served from the cache. Every write path invalidates the
//! affected keys before and after the backing write, so a lookup racing the
//! write cannot leave the old row cached. Scans (`find_stale`,
//! `list_by_source`) and pass records always go to the backing ledger.

use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;

use crate::domain::models::{IndexingLedgerEntry, LedgerKey, SourcePass};
use crate::domain::ports::IndexingLedger;
use crate::error::Result;

pub struct CachedLedger {
    inner: Arc<dyn IndexingLedger>,
    cache: Cache<LedgerKey, IndexingLedgerEntry>,
}

impl CachedLedger {
    pub fn new(inner: Arc<dyn IndexingLedger>, max_entries: u64) -> Self {
        Self {
            inner,
            cache: Cache::builder().max_capacity(max_entries).build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    async fn invalidate_keys(&self, keys: &[LedgerKey]) {
        for key in keys {
            self.cache.invalidate(key).await;
        }
    }

    /// Drop every cached lookup
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl IndexingLedger for CachedLedger {
    async fn get(&self, key: &LedgerKey) -> Result<Option<IndexingLedgerEntry>> {
        if let Some(entry) = self.cache.get(key).await {
            return Ok(Some(entry));
        }

        let loaded = self.inner.get(key).await?;
        if let Some(entry) = &loaded {
            self.cache.insert(key.clone(), entry.clone()).await;
        }
        Ok(loaded)
    }

    async fn upsert(&self, entry: &IndexingLedgerEntry) -> Result<()> {
        let key = entry.key();
        self.cache.invalidate(&key).await;
        self.inner.upsert(entry).await?;
        self.cache.insert(key, entry.clone()).await;
        Ok(())
    }

    async fn touch_transaction(&self, key: &LedgerKey, transaction_id: &str) -> Result<bool> {
        self.cache.invalidate(key).await;
        let touched = self.inner.touch_transaction(key, transaction_id).await;
        self.cache.invalidate(key).await;
        touched
    }

    async fn delete(&self, key: &LedgerKey) -> Result<bool> {
        self.cache.invalidate(key).await;
        let deleted = self.inner.delete(key).await;
        self.cache.invalidate(key).await;
        deleted
    }

    async fn delete_batch(&self, keys: &[LedgerKey]) -> Result<usize> {
        self.invalidate_keys(keys).await;
        let deleted = self.inner.delete_batch(keys).await;
        self.invalidate_keys(keys).await;
        deleted
    }

    async fn find_stale(
        &self,
        source: &str,
        transaction_id: &str,
    ) -> Result<Vec<IndexingLedgerEntry>> {
        self.inner.find_stale(source, transaction_id).await
    }

    async fn list_by_source(&self, source: &str) -> Result<Vec<IndexingLedgerEntry>> {
        self.inner.list_by_source(source).await
    }

    async fn count(&self, source: &str) -> Result<usize> {
        self.inner.count(source).await
    }

    async fn record_pass(&self, pass: &SourcePass) -> Result<()> {
        self.inner.record_pass(pass).await
    }

    async fn latest_pass(&self, source: &str) -> Result<Option<SourcePass>> {
        self.inner.latest_pass(source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::InMemoryLedger;

    fn entry(tx: &str, checksum: &str) -> IndexingLedgerEntry {
        IndexingLedgerEntry::new(
            LedgerKey::new("a", "docs", "live", "en"),
            checksum,
            tx,
            vec!["docs".to_string()],
        )
    }

    #[tokio::test]
    async fn test_touch_invalidates_cached_lookup() {
        let backing = InMemoryLedger::new();
        let cached = CachedLedger::new(Arc::new(backing.clone()), 100);
        let e = entry("t0", "h1");
        cached.upsert(&e).await.unwrap();

        // Warm the cache
        assert_eq!(cached.get(&e.key()).await.unwrap().unwrap().transaction_id, "t0");

        cached.touch_transaction(&e.key(), "t1").await.unwrap();
        assert_eq!(cached.get(&e.key()).await.unwrap().unwrap().transaction_id, "t1");
    }

    #[tokio::test]
    async fn test_delete_invalidates_cached_lookup() {
        let backing = InMemoryLedger::new();
        let cached = CachedLedger::new(Arc::new(backing), 100);
        let e = entry("t0", "h1");
        cached.upsert(&e).await.unwrap();
        cached.get(&e.key()).await.unwrap();

        cached.delete_batch(&[e.key()]).await.unwrap();
        assert!(cached.get(&e.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_cached_value() {
        let cached = CachedLedger::new(Arc::new(InMemoryLedger::new()), 100);
        cached.upsert(&entry("t0", "h1")).await.unwrap();
        cached.upsert(&entry("t1", "h2")).await.unwrap();

        let loaded = cached.get(&entry("t1", "h2").key()).await.unwrap().unwrap();
        assert_eq!(loaded.checksum, "h2");
    }

    /// Pauses inside `touch_transaction` and `delete` until released
    struct GatedLedger {
        inner: InMemoryLedger,
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    impl GatedLedger {
        async fn gate(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    #[async_trait]
    impl IndexingLedger for GatedLedger {
        async fn get(&self, key: &LedgerKey) -> Result<Option<IndexingLedgerEntry>> {
            self.inner.get(key).await
        }

        async fn upsert(&self, entry: &IndexingLedgerEntry) -> Result<()> {
            self.inner.upsert(entry).await
        }

        async fn touch_transaction(&self, key: &LedgerKey, transaction_id: &str) -> Result<bool> {
            self.gate().await;
            self.inner.touch_transaction(key, transaction_id).await
        }

        async fn delete(&self, key: &LedgerKey) -> Result<bool> {
            self.gate().await;
            self.inner.delete(key).await
        }

        async fn delete_batch(&self, keys: &[LedgerKey]) -> Result<usize> {
            self.inner.delete_batch(keys).await
        }

        async fn find_stale(
            &self,
            source: &str,
            transaction_id: &str,
        ) -> Result<Vec<IndexingLedgerEntry>> {
            self.inner.find_stale(source, transaction_id).await
        }

        async fn list_by_source(&self, source: &str) -> Result<Vec<IndexingLedgerEntry>> {
            self.inner.list_by_source(source).await
        }

        async fn count(&self, source: &str) -> Result<usize> {
            self.inner.count(source).await
        }

        async fn record_pass(&self, pass: &SourcePass) -> Result<()> {
            self.inner.record_pass(pass).await
        }

        async fn latest_pass(&self, source: &str) -> Result<Option<SourcePass>> {
            self.inner.latest_pass(source).await
        }
    }

    fn gated() -> (Arc<CachedLedger>, Arc<tokio::sync::Notify>, Arc<tokio::sync::Notify>) {
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let backing = GatedLedger {
            inner: InMemoryLedger::new(),
            entered: entered.clone(),
            release: release.clone(),
        };
        (
            Arc::new(CachedLedger::new(Arc::new(backing), 100)),
            entered,
            release,
        )
    }

    #[tokio::test]
    async fn test_lookup_racing_touch_does_not_keep_old_row() {
        let (cached, entered, release) = gated();
        let e = entry("t0", "h1");
        cached.upsert(&e).await.unwrap();

        let writer = {
            let cached = cached.clone();
            let key = e.key();
            tokio::spawn(async move { cached.touch_transaction(&key, "t1").await })
        };

        // Reload the old row while the backing write is held
        entered.notified().await;
        assert_eq!(cached.get(&e.key()).await.unwrap().unwrap().transaction_id, "t0");

        release.notify_one();
        assert!(writer.await.unwrap().unwrap());
        assert_eq!(cached.get(&e.key()).await.unwrap().unwrap().transaction_id, "t1");
    }

    #[tokio::test]
    async fn test_lookup_racing_delete_does_not_resurrect_row() {
        let (cached, entered, release) = gated();
        let e = entry("t0", "h1");
        cached.upsert(&e).await.unwrap();

        let writer = {
            let cached = cached.clone();
            let key = e.key();
            tokio::spawn(async move { cached.delete(&key).await })
        };

        entered.notified().await;
        assert!(cached.get(&e.key()).await.unwrap().is_some());

        release.notify_one();
        assert!(writer.await.unwrap().unwrap());
        assert!(cached.get(&e.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let backing = InMemoryLedger::new();
        let cached = CachedLedger::new(Arc::new(backing.clone()), 100);
        let e = entry("t0", "h1");

        assert!(cached.get(&e.key()).await.unwrap().is_none());
        // Written behind the cache's back
        backing.upsert(&e).await.unwrap();
        assert!(cached.get(&e.key()).await.unwrap().is_some());
    }
}
