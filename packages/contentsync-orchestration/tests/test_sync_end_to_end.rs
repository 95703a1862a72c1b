//! End-to-end synchronization scenarios
//!
//! Producer -> queue -> forwarder workers -> recording engine, with the
//! ledger and status log inspected after each pass.

mod common;

use common::{fixture, key, page};
use contentsync_orchestration::{JobItem, SyncError};
use contentsync_storage::{IndexingLedger, SyncStatus};

#[tokio::test]
async fn test_object_lifecycle_across_three_passes() {
    let f = fixture().await;

    // Pass 1: p1 is new
    let first = f.full_pass(vec![page("p1", "h1")]).await;
    assert_eq!(
        f.log.statuses_for("p1"),
        vec![SyncStatus::SentToQueue, SyncStatus::Received, SyncStatus::Indexed]
    );
    let entry = f.ledger.get(&key("p1")).await.unwrap().unwrap();
    assert_eq!(entry.transaction_id, first.transaction_id);
    assert_eq!(entry.checksum, "h1");
    assert!(f.search.contains("docs", "en", "p1"));

    // Pass 2: same content, only the transaction stamp moves
    let second = f.full_pass(vec![page("p1", "h1")]).await;
    let statuses = f.log.statuses_for("p1");
    assert_eq!(statuses.last(), Some(&SyncStatus::Skipped));
    assert_eq!(
        statuses.iter().filter(|s| **s == SyncStatus::Indexed).count(),
        1
    );
    let touched = f.ledger.get(&key("p1")).await.unwrap().unwrap();
    assert_eq!(touched.transaction_id, second.transaction_id);
    assert_eq!(touched.modified_at, entry.modified_at);

    // Pass 3: p1 no longer exists upstream
    f.full_pass(vec![page("p2", "h2")]).await;
    assert_eq!(f.log.statuses_for("p1").last(), Some(&SyncStatus::Deindexed));
    assert!(f.ledger.get(&key("p1")).await.unwrap().is_none());
    assert!(!f.search.contains("docs", "en", "p1"));
    assert_eq!(f.ledger_ids().await, vec!["p2".to_string()]);

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_resending_a_batch_is_idempotent() {
    let f = fixture().await;
    let session = f.engine.begin_session("cms", false).await.unwrap();
    let items = vec![page("p1", "h1"), page("p2", "h2")];

    f.engine.send(&session, items.clone()).await.unwrap();
    f.drain(&session).await;
    let calls_after_first = f.search.calls();

    f.engine.send(&session, items).await.unwrap();
    f.drain(&session).await;

    assert_eq!(f.search.calls(), calls_after_first);
    assert_eq!(f.log.count_status(SyncStatus::Indexed), 2);
    assert_eq!(f.log.count_status(SyncStatus::Skipped), 2);
    assert_eq!(f.ledger_ids().await, vec!["p1".to_string(), "p2".to_string()]);

    f.engine.finish_session(&session).await.unwrap();
    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_changed_checksum_is_reindexed() {
    let f = fixture().await;
    f.full_pass(vec![page("p1", "h1")]).await;
    f.full_pass(vec![page("p1", "h2")]).await;

    assert_eq!(f.log.count_status(SyncStatus::Indexed), 2);
    let entry = f.ledger.get(&key("p1")).await.unwrap().unwrap();
    assert_eq!(entry.checksum, "h2");

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_explicit_delete() {
    let f = fixture().await;
    let session = f.engine.begin_session("cms", false).await.unwrap();
    f.engine
        .send(&session, vec![page("p1", "h1"), page("p2", "h2")])
        .await
        .unwrap();
    f.drain(&session).await;

    f.engine
        .send(&session, vec![JobItem::delete("p1", ["docs"], "en")])
        .await
        .unwrap();
    f.drain(&session).await;

    assert_eq!(f.log.statuses_for("p1").last(), Some(&SyncStatus::Deindexed));
    assert_eq!(f.ledger_ids().await, vec!["p2".to_string()]);

    let report = f.engine.finish_session(&session).await.unwrap().unwrap();
    assert_eq!(report.examined, 0);
    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_unknown_site_is_ignored_not_retried() {
    let f = fixture().await;
    let item = JobItem::create("p1", ["shop"], "en").with_checksum("h1");

    f.full_pass(vec![item]).await;

    let records = f.log.records_for("p1");
    let last = records.last().unwrap();
    assert_eq!(last.status, SyncStatus::Ignored);
    assert!(last.reason.as_deref().unwrap().contains("shop"));
    assert_eq!(f.search.calls(), 0);
    assert!(f.ledger_ids().await.is_empty());

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_multi_locale_fan_out_commits_once_per_target() {
    let f = fixture().await;
    let items = vec![
        JobItem::create("p1", ["docs", "blog"], "en").with_checksum("h1"),
        JobItem::create("p1", ["docs"], "pt").with_checksum("h1-pt"),
        JobItem::create("p2", ["docs"], "en").with_checksum("h2"),
    ];

    f.full_pass(items).await;

    let batches = f.search.batches();
    assert_eq!(batches.len(), 1);
    let commits: Vec<(String, String)> = batches[0]
        .iter()
        .filter(|i| i.is_commit())
        .map(|i| (i.site_names[0].clone(), i.locale.clone()))
        .collect();
    assert_eq!(commits.len(), 3);
    assert!(commits.contains(&("blog".to_string(), "en".to_string())));
    assert!(commits.contains(&("docs".to_string(), "pt".to_string())));
    assert!(f.search.contains("docs", "pt", "p1"));

    // One ledger entry per (object, locale)
    assert_eq!(f.ledger.count("cms").await.unwrap(), 3);
    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_second_full_session_for_source_is_rejected() {
    let f = fixture().await;
    let first = f.engine.begin_session("cms", false).await.unwrap();

    let err = f.engine.begin_session("cms", false).await.unwrap_err();
    assert!(matches!(err, SyncError::SessionConflict { .. }));

    // A standalone trigger can still run meanwhile
    let receipt = f.engine.reindex("cms", vec![page("p9", "h9")]).await.unwrap();
    assert_eq!(receipt.accepted, 1);

    f.engine.finish_session(&first).await.unwrap();
    assert!(f.engine.begin_session("cms", false).await.is_ok());
    f.engine.shutdown().await;
}
