//! Integration tests for checkpoint retention.

use std::sync::Arc;

use chrono::{Duration, Utc};
use docflow::models::checkpoint::Checkpoint;
use docflow::models::phase::Phase;
use docflow::persistence::{db, retention, SqliteCheckpointStore};
use serde_json::json;

fn aged(session_id: &str, sequence: u64, days_old: i64) -> Checkpoint {
    let mut checkpoint = Checkpoint::new(
        session_id.to_owned(),
        sequence,
        "batch".to_owned(),
        Phase::Drafting,
        json!({}),
        String::new(),
    );
    checkpoint.created_at = Utc::now() - Duration::days(days_old);
    checkpoint
}

#[tokio::test]
async fn purge_removes_old_superseded_checkpoints() {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let store = SqliteCheckpointStore::new(Arc::clone(&pool));

    for sequence in 1..=3 {
        store.create(&aged("old", sequence, 40)).await.expect("old");
    }
    store.create(&aged("lonely", 1, 40)).await.expect("lonely");
    store.create(&aged("fresh", 1, 2)).await.expect("fresh 1");
    store.create(&aged("fresh", 2, 1)).await.expect("fresh 2");

    let deleted = retention::purge(&pool, 30).await.expect("purge");
    assert_eq!(deleted, 2);

    let old: Vec<u64> = store
        .list_for_session("old")
        .await
        .expect("old")
        .iter()
        .map(|cp| cp.sequence)
        .collect();
    assert_eq!(old, vec![3], "latest checkpoint survives");
    assert_eq!(store.list_for_session("lonely").await.expect("lonely").len(), 1);
    assert_eq!(store.list_for_session("fresh").await.expect("fresh").len(), 2);
}

#[tokio::test]
async fn purge_with_nothing_expired_deletes_nothing() {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let store = SqliteCheckpointStore::new(Arc::clone(&pool));
    store.create(&aged("s1", 1, 3)).await.expect("create");
    store.create(&aged("s1", 2, 0)).await.expect("create");

    assert_eq!(retention::purge(&pool, 30).await.expect("purge"), 0);
}

#[tokio::test]
async fn retention_task_stops_on_cancel() {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = retention::spawn_retention_task(Arc::clone(&pool), 30, cancel.clone());

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("task exits")
        .expect("no panic");
}
