//! Status log writer
//!
//! Wraps a [`StatusLogSink`] so that a failing sink never aborts indexing:
//! failures are logged and counted, the caller carries on.

use crate::job::JobItem;
use crate::session::SynchronizationSession;
use contentsync_storage::{StatusLogRecord, StatusLogSink, SyncStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct StatusLogWriter {
    sink: Arc<dyn StatusLogSink>,
    failures: Arc<AtomicU64>,
}

impl StatusLogWriter {
    pub fn new(sink: Arc<dyn StatusLogSink>) -> Self {
        Self {
            sink,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record describing `item` in `session`
    pub fn record_for(
        session: &SynchronizationSession,
        item: &JobItem,
        status: SyncStatus,
    ) -> StatusLogRecord {
        let mut record = StatusLogRecord::new(
            session.source.clone(),
            session.transaction_id.clone(),
            item.action.as_str(),
            status,
        )
        .with_target(
            item.environment.clone(),
            item.locale.clone(),
            item.site_names.clone(),
        )
        .with_checksum(item.checksum.clone());

        if let Some(object_id) = &item.object_id {
            record = record.with_object(object_id.clone());
        }
        record
    }

    pub async fn record(&self, record: StatusLogRecord) {
        if let Err(e) = self.sink.append(&record).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %e,
                status = %record.status,
                object_id = record.object_id.as_deref().unwrap_or("-"),
                "Status log append failed"
            );
        }
    }

    pub async fn record_all(&self, records: Vec<StatusLogRecord>) {
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.sink.append_all(&records).await {
            self.failures
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            warn!(error = %e, count = records.len(), "Status log append failed");
        }
    }

    pub async fn item(
        &self,
        session: &SynchronizationSession,
        item: &JobItem,
        status: SyncStatus,
        reason: Option<&str>,
    ) {
        let mut record = Self::record_for(session, item, status);
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }
        self.record(record).await;
    }

    /// Same status for every item
    pub async fn items(
        &self,
        session: &SynchronizationSession,
        items: &[JobItem],
        status: SyncStatus,
        reason: Option<&str>,
    ) {
        let records = items
            .iter()
            .map(|item| {
                let record = Self::record_for(session, item, status);
                match reason {
                    Some(reason) => record.with_reason(reason),
                    None => record,
                }
            })
            .collect();
        self.record_all(records).await;
    }

    /// Records lost to sink failures since start
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
