use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use sessionstore_core::{
    BackendKind, BatchConfig, CancellationToken, DatabaseConfig, ListFilter, SessionRecord, Store,
    StoreConfig, StoreError,
};
use sqlx::SqlitePool;
use tempfile::TempDir;

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("sessions.db").display())
}

async fn sqlite_store(batch: BatchConfig) -> (Store, TempDir) {
    sqlite_store_with_timeout(batch, DatabaseConfig::default().operation_timeout_ms).await
}

async fn sqlite_store_with_timeout(
    batch: BatchConfig,
    operation_timeout_ms: u64,
) -> (Store, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StoreConfig {
        database: DatabaseConfig {
            backend: BackendKind::Sqlite,
            url: database_url(&dir),
            max_connections: 4,
            operation_timeout_ms,
            ..DatabaseConfig::default()
        },
        batch,
        ..StoreConfig::default()
    };

    let store = Store::connect(&config).await.expect("Failed to open SQLite store");
    store.ensure_schema().await.expect("Failed to create schema");
    (store, dir)
}

fn historical() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn test_bulk_upsert_then_list_by_agent() {
    let (store, _dir) = sqlite_store(BatchConfig {
        batch_size: 16,
        ..BatchConfig::default()
    })
    .await;

    let records: Vec<_> = (0..100)
        .map(|i| {
            let agent = if i % 4 == 0 { "agent-x" } else { "agent-y" };
            let mut record = SessionRecord::new(format!("session-{i:03}")).with_agent(agent);
            record.state = json!({"turn": i});
            record
        })
        .collect();

    let report = store.upsert_many(&records, false).await.unwrap();
    assert_eq!(report.records, 100);
    assert_eq!(report.windows, 7);
    assert_eq!(report.shrinks, 0);

    for record in &records {
        let stored = store.get(&record.session_id).await.unwrap();
        assert_eq!(stored.state, record.state);
    }

    let agent_x = store.list_by_agent("agent-x").await.unwrap();
    assert_eq!(agent_x.len(), 25);
    assert!(agent_x.iter().all(|r| r.agent_id.as_deref() == Some("agent-x")));
}

#[tokio::test]
async fn test_preserve_updated_at_is_stored_exactly() {
    let (store, _dir) = sqlite_store(BatchConfig::default()).await;
    let record = SessionRecord::new("migrated")
        .with_created_at(historical())
        .with_updated_at(historical());

    store.upsert_many(&[record.clone()], true).await.unwrap();
    assert_eq!(store.get("migrated").await.unwrap().updated_at, Some(historical()));

    // Re-running the migration leaves the row unchanged.
    store.upsert_many(&[record.clone()], true).await.unwrap();
    let stored = store.get("migrated").await.unwrap();
    assert_eq!(stored.created_at, Some(historical()));
    assert_eq!(stored.updated_at, Some(historical()));

    let single = store.upsert_one(&record, true).await.unwrap();
    assert_eq!(single.updated_at, Some(historical()));
}

#[tokio::test]
async fn test_bulk_update_keeps_created_at_and_advances_updated_at() {
    let (store, _dir) = sqlite_store(BatchConfig::default()).await;
    let original = SessionRecord::new("s-1").with_created_at(historical());
    store.upsert_one(&original, false).await.unwrap();

    let rewrite = SessionRecord::new("s-1")
        .with_name("renamed")
        .with_created_at(Utc::now());
    store.upsert_many(&[rewrite], false).await.unwrap();

    let stored = store.get("s-1").await.unwrap();
    assert_eq!(stored.created_at, Some(historical()));
    assert_eq!(stored.name.as_deref(), Some("renamed"));
    assert!(stored.updated_at.unwrap() > historical());
}

#[tokio::test]
async fn test_idempotent_re_upsert_only_moves_updated_at() {
    let (store, _dir) = sqlite_store(BatchConfig::default()).await;
    let mut record = SessionRecord::new("s-1").with_user("user-1");
    record.push_run(json!({"run": 1}));

    store.upsert_one(&record, false).await.unwrap();
    let first = store.get("s-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    store.upsert_one(&record, false).await.unwrap();
    let second = store.get("s-1").await.unwrap();

    assert!(first.same_content(&second));
    assert!(second.updated_at > first.updated_at);

    tokio::time::sleep(Duration::from_millis(2)).await;
    store.upsert_many(&[record], false).await.unwrap();
    let third = store.get("s-1").await.unwrap();
    assert!(third.updated_at > second.updated_at);
}

#[tokio::test]
async fn test_competing_writer_fails_window_without_partial_rows() {
    let (store, dir) = sqlite_store_with_timeout(
        BatchConfig {
            batch_size: 4,
            min_batch_size: 1,
            max_retries: 3,
            ..BatchConfig::default()
        },
        1_000,
    )
    .await;
    let records: Vec<_> = (0..8)
        .map(|i| SessionRecord::new(format!("k{i}")).with_agent("contended"))
        .collect();
    store.upsert_many(&records[..4], false).await.unwrap();

    // A second connection holds the database write lock with an open transaction.
    let other = SqlitePool::connect(&database_url(&dir)).await.unwrap();
    let mut blocker = other.begin().await.unwrap();
    sqlx::query(
        "INSERT INTO sessions (session_id, created_at, updated_at) \
         VALUES ('blocker', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')",
    )
    .execute(&mut *blocker)
    .await
    .unwrap();

    let err = store.upsert_many(&records[4..], false).await.unwrap_err();
    assert!(err.is_retryable(), "lock contention is retryable: {err}");

    let stored: Vec<String> = store
        .list(&ListFilter::by_agent("contended").ascending())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.session_id)
        .collect();
    assert_eq!(stored, vec!["k0", "k1", "k2", "k3"]);

    blocker.rollback().await.unwrap();
    other.close().await;

    let report = store.upsert_many(&records[4..], false).await.unwrap();
    assert_eq!(report.records, 4);
    assert_eq!(report.shrinks, 0);
    assert_eq!(store.list_by_agent("contended").await.unwrap().len(), 8);
    assert!(store.get("blocker").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_duplicates_in_one_call_resolve_to_last() {
    let (store, _dir) = sqlite_store(BatchConfig {
        batch_size: 2,
        ..BatchConfig::default()
    })
    .await;

    // Duplicates land both within a window and across windows.
    let records = vec![
        SessionRecord::new("dup").with_name("v1"),
        SessionRecord::new("dup").with_name("v2"),
        SessionRecord::new("other"),
        SessionRecord::new("dup").with_name("v3"),
    ];
    store.upsert_many(&records, false).await.unwrap();

    assert_eq!(store.get("dup").await.unwrap().name.as_deref(), Some("v3"));
    assert_eq!(store.list(&ListFilter::new()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_session_is_not_found() {
    let (store, _dir) = sqlite_store(BatchConfig::default()).await;

    assert!(matches!(
        store.get("nope").await,
        Err(StoreError::NotFound(id)) if id == "nope"
    ));
    assert!(store.delete("nope").await.unwrap_err().is_not_found());

    store.upsert_one(&SessionRecord::new("yes"), false).await.unwrap();
    store.delete("yes").await.unwrap();
    assert!(store.get("yes").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_list_orders_by_updated_at_and_honors_limit() {
    let (store, _dir) = sqlite_store(BatchConfig::default()).await;
    let records: Vec<_> = (0..5)
        .map(|i| {
            SessionRecord::new(format!("s-{i}"))
                .with_user("user-1")
                .with_updated_at(historical() + chrono::Duration::minutes(i))
        })
        .collect();
    store.upsert_many(&records, true).await.unwrap();

    let newest = store
        .list(&ListFilter::by_user("user-1").limit(2))
        .await
        .unwrap();
    let ids: Vec<_> = newest.iter().map(|r| r.session_id.as_str()).collect();
    assert_eq!(ids, vec!["s-4", "s-3"]);

    let oldest = store
        .list(&ListFilter::by_user("user-1").ascending().limit(1))
        .await
        .unwrap();
    assert_eq!(oldest[0].session_id, "s-0");

    assert!(store.list_by_user("user-2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_input_and_invalid_records() {
    let (store, _dir) = sqlite_store(BatchConfig::default()).await;

    let report = store.upsert_many(&[], false).await.unwrap();
    assert_eq!(report.windows, 0);

    let bad = vec![SessionRecord::new("ok"), SessionRecord::new("")];
    let err = store.upsert_many(&bad, false).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRecord(_)));
    assert!(store.get("ok").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_pre_cancelled_token_writes_nothing() {
    let (store, _dir) = sqlite_store(BatchConfig::default()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = store
        .upsert_many_cancellable(&[SessionRecord::new("s-1")], false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Cancelled));
    assert!(store.get("s-1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let (store, dir) = sqlite_store(BatchConfig::default()).await;
    store
        .upsert_one(&SessionRecord::new("durable").with_agent("a"), false)
        .await
        .unwrap();
    store.close().await.unwrap();

    let config = StoreConfig {
        database: DatabaseConfig {
            backend: BackendKind::Sqlite,
            url: format!("sqlite://{}", dir.path().join("sessions.db").display()),
            ..DatabaseConfig::default()
        },
        ..StoreConfig::default()
    };
    let reopened = Store::connect(&config).await.unwrap();
    assert_eq!(
        reopened.get("durable").await.unwrap().agent_id.as_deref(),
        Some("a")
    );
}
