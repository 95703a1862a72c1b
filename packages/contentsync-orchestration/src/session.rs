use crate::error::{Result, SyncError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

/// One producer pass over a source
///
/// Full sessions claim to enumerate the whole source and are reconciled
/// when they finish. Standalone sessions touch a handful of objects and
/// are never reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationSession {
    pub source: String,
    pub transaction_id: String,
    pub standalone: bool,
}

impl SynchronizationSession {
    pub fn new(source: impl Into<String>, standalone: bool) -> Self {
        Self {
            source: source.into(),
            transaction_id: Uuid::new_v4().to_string(),
            standalone,
        }
    }

    pub fn full(source: impl Into<String>) -> Self {
        Self::new(source, false)
    }

    pub fn standalone(source: impl Into<String>) -> Self {
        Self::new(source, true)
    }

    pub fn kind(&self) -> &'static str {
        if self.standalone {
            "standalone"
        } else {
            "full"
        }
    }
}

impl std::fmt::Display for SynchronizationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.source, self.transaction_id, self.kind())
    }
}

/// Open sessions, per-source full-session locks and in-flight batch counts
#[derive(Default)]
pub struct SessionRegistry {
    /// transaction id -> session
    open: DashMap<String, SynchronizationSession>,
    /// source -> transaction id of its active full session or reconciliation
    locks: DashMap<String, String>,
    /// transaction id -> batches published but not yet settled
    in_flight: DashMap<String, usize>,
    /// transaction id -> batches given up on
    dead_lettered: DashMap<String, usize>,
    settled: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. At most one full session per source may be open.
    pub fn begin(&self, source: &str, standalone: bool) -> Result<SynchronizationSession> {
        let session = SynchronizationSession::new(source, standalone);

        if !standalone {
            self.claim_source(source, &session.transaction_id)?;
        }

        self.open
            .insert(session.transaction_id.clone(), session.clone());
        info!(
            source = %session.source,
            transaction_id = %session.transaction_id,
            kind = session.kind(),
            "Session opened"
        );
        Ok(session)
    }

    pub fn is_open(&self, session: &SynchronizationSession) -> bool {
        self.open.contains_key(&session.transaction_id)
    }

    /// Take the source lock for `transaction_id`. Fails while a full
    /// session or a reconciliation holds it.
    pub fn claim_source(&self, source: &str, transaction_id: &str) -> Result<()> {
        match self.locks.entry(source.to_string()) {
            Entry::Occupied(active) => Err(SyncError::SessionConflict {
                source_name: source.to_string(),
                active_transaction: active.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(transaction_id.to_string());
                Ok(())
            }
        }
    }

    /// Free the source lock if `transaction_id` still holds it
    pub fn release_source(&self, source: &str, transaction_id: &str) {
        self.locks.remove_if(source, |_, tx| tx == transaction_id);
    }

    /// Close a session and free its source lock. Releasing twice is a no-op.
    pub fn release(&self, session: &SynchronizationSession) {
        self.open.remove(&session.transaction_id);
        self.dead_lettered.remove(&session.transaction_id);
        if !session.standalone {
            self.release_source(&session.source, &session.transaction_id);
        }
        debug!(session = %session, "Session released");
    }

    /// Transaction id of the active full session for `source`
    pub fn active_transaction(&self, source: &str) -> Option<String> {
        self.locks.get(source).map(|tx| tx.clone())
    }

    pub fn batch_published(&self, transaction_id: &str) {
        *self
            .in_flight
            .entry(transaction_id.to_string())
            .or_insert(0) += 1;
    }

    /// A batch was acked (indexed, ignored or dead-lettered)
    pub fn batch_settled(&self, transaction_id: &str) {
        if let Some(mut pending) = self.in_flight.get_mut(transaction_id) {
            *pending = pending.saturating_sub(1);
        }
        self.in_flight.remove_if(transaction_id, |_, pending| *pending == 0);
        self.settled.notify_waiters();
    }

    /// A batch was given up on and acked. It still settles, but the session
    /// can no longer be reconciled.
    pub fn batch_dead_lettered(&self, transaction_id: &str) {
        *self
            .dead_lettered
            .entry(transaction_id.to_string())
            .or_insert(0) += 1;
        self.batch_settled(transaction_id);
    }

    pub fn dead_lettered(&self, transaction_id: &str) -> usize {
        self.dead_lettered
            .get(transaction_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn pending(&self, transaction_id: &str) -> usize {
        self.in_flight
            .get(transaction_id)
            .map(|pending| *pending)
            .unwrap_or(0)
    }

    /// Wait until every batch of `transaction_id` has settled
    pub async fn wait_drained(&self, transaction_id: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            // Register before checking so a settle between check and await is not missed
            notified.as_mut().enable();

            let pending = self.pending(transaction_id);
            if pending == 0 {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SyncError::DrainTimeout {
                    transaction_id: transaction_id.to_string(),
                    pending: self.pending(transaction_id),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_full_sessions_are_single_flight_per_source() {
        let registry = SessionRegistry::new();
        let first = registry.begin("cms", false).unwrap();

        let err = registry.begin("cms", false).unwrap_err();
        match err {
            SyncError::SessionConflict {
                source_name,
                active_transaction,
            } => {
                assert_eq!(source_name, "cms");
                assert_eq!(active_transaction, first.transaction_id);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Other sources and standalone sessions are unaffected
        assert!(registry.begin("crawler", false).is_ok());
        assert!(registry.begin("cms", true).is_ok());

        registry.release(&first);
        assert!(!registry.is_open(&first));
        assert!(registry.begin("cms", false).is_ok());
    }

    #[test]
    fn test_release_of_stale_session_keeps_newer_lock() {
        let registry = SessionRegistry::new();
        let first = registry.begin("cms", false).unwrap();
        registry.release(&first);
        let second = registry.begin("cms", false).unwrap();

        registry.release(&first);
        assert_eq!(
            registry.active_transaction("cms"),
            Some(second.transaction_id.clone())
        );
    }

    #[test]
    fn test_claimed_source_blocks_full_sessions() {
        let registry = SessionRegistry::new();
        registry.claim_source("cms", "tx-reconcile").unwrap();

        assert!(matches!(
            registry.begin("cms", false),
            Err(SyncError::SessionConflict { .. })
        ));

        // Only the holder frees the lock
        registry.release_source("cms", "tx-other");
        assert!(registry.begin("cms", false).is_err());
        registry.release_source("cms", "tx-reconcile");
        assert!(registry.begin("cms", false).is_ok());
    }

    #[tokio::test]
    async fn test_dead_lettered_batches_settle_and_are_counted() {
        let registry = SessionRegistry::new();
        let session = registry.begin("cms", false).unwrap();
        let tx = session.transaction_id.clone();
        registry.batch_published(&tx);
        registry.batch_published(&tx);

        registry.batch_settled(&tx);
        registry.batch_dead_lettered(&tx);

        registry
            .wait_drained(&tx, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(registry.dead_lettered(&tx), 1);

        registry.release(&session);
        assert_eq!(registry.dead_lettered(&tx), 0);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = SynchronizationSession::full("cms");
        let b = SynchronizationSession::full("cms");
        assert_ne!(a.transaction_id, b.transaction_id);
        assert_eq!(a.kind(), "full");
        assert_eq!(SynchronizationSession::standalone("cms").kind(), "standalone");
    }

    #[test]
    fn test_serialized_session_carries_transaction_id() {
        let session = SynchronizationSession::full("cms");
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["transactionId"], session.transaction_id.as_str());
        assert_eq!(json["source"], "cms");

        let back: SynchronizationSession = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
    }

    #[tokio::test]
    async fn test_wait_drained_returns_when_batches_settle() {
        let registry = Arc::new(SessionRegistry::new());
        registry.batch_published("tx");
        registry.batch_published("tx");
        assert_eq!(registry.pending("tx"), 2);

        let settler = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                registry.batch_settled("tx");
                tokio::time::sleep(Duration::from_millis(10)).await;
                registry.batch_settled("tx");
            })
        };

        registry
            .wait_drained("tx", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(registry.pending("tx"), 0);
        settler.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_drained_times_out() {
        let registry = SessionRegistry::new();
        registry.batch_published("tx");

        let err = registry
            .wait_drained("tx", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::DrainTimeout { pending: 1, .. }));
    }

    #[tokio::test]
    async fn test_wait_drained_without_batches() {
        let registry = SessionRegistry::new();
        registry
            .wait_drained("nothing", Duration::from_millis(1))
            .await
            .unwrap();
    }
}
