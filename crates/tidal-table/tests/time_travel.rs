//! Snapshot selection by version and timestamp, history and log retention.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tidal_table::log::{checkpoint_path, entry_path};
use tidal_table::prelude::*;
use tidal_test_utils::{table_xy, xy_batch, TestTable};

async fn append(table: Table, x: i64) -> Table {
    let (table, _) = table
        .write([xy_batch(&[x], &[Some(x * 10)])])
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap();
    table
}

fn file_set(table: &Table) -> BTreeSet<String> {
    table
        .snapshot()
        .unwrap()
        .files()
        .map(|f| f.path.clone())
        .collect()
}

fn commit_time(table: &Table) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(table.snapshot().unwrap().timestamp()).unwrap()
}

#[tokio::test]
async fn test_missing_table_is_reported() {
    let location = TestTable::new();
    let handle = location.handle();
    assert!(!handle.is_table().await.unwrap());

    let err = TableBuilder::from_storage(location.storage())
        .load()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::TableNotFound { .. }));
    assert!(matches!(
        handle.history(None).await,
        Err(TableError::TableNotFound { .. })
    ));
}

#[tokio::test]
async fn test_load_version_is_stable_across_later_commits() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(10)]).await;
    let table = append(table, 2).await;

    let mut v1 = location.handle();
    v1.load_version(1).await.unwrap();
    let before = file_set(&v1);

    let table = append(table, 3).await;
    assert_eq!(table.version(), Some(2));

    let mut again = location.handle();
    again.load_version(1).await.unwrap();
    assert_eq!(file_set(&again), before);
    assert_eq!(table_xy(&again).await, vec![(1, Some(10)), (2, Some(20))]);

    let mut v0 = location.handle();
    v0.load_version(0).await.unwrap();
    assert_eq!(table_xy(&v0).await, vec![(1, Some(10))]);
}

#[tokio::test]
async fn test_versions_past_the_head_are_not_found() {
    let location = TestTable::new();
    location.create_xy(&[1], &[Some(10)]).await;

    let err = TableBuilder::from_storage(location.storage())
        .with_version(5)
        .load()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::VersionNotFound { .. }));
}

#[tokio::test]
async fn test_timestamp_selection_never_returns_a_later_version() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(10)]).await;
    let v0_time = commit_time(&table);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let table = append(table, 2).await;
    let v1_time = commit_time(&table);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let table = append(table, 3).await;
    assert!(v0_time < v1_time);

    let at_v1 = TableBuilder::from_storage(location.storage())
        .with_datestamp(v1_time)
        .load()
        .await
        .unwrap();
    assert_eq!(at_v1.version(), Some(1));

    let between = TableBuilder::from_storage(location.storage())
        .with_datestamp(v1_time - Duration::milliseconds(1))
        .load()
        .await
        .unwrap();
    assert_eq!(between.version(), Some(0));

    let mut future = location.handle();
    future
        .load_datetime(Utc::now() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(future.version(), table.version());

    let err = TableBuilder::from_storage(location.storage())
        .with_datestamp(v0_time - Duration::seconds(1))
        .load()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::VersionNotFound { .. }));
}

#[tokio::test]
async fn test_history_is_newest_first_and_limited() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(10)]).await;
    let table = append(table, 2).await;
    let table = append(table, 3).await;

    let history = table.history(None).await.unwrap();
    let versions: Vec<_> = history.iter().map(|h| h.version).collect();
    assert_eq!(versions, [2, 1, 0]);
    assert!(history.iter().all(|h| h.info.operation == "WRITE"));
    assert!(history[0].info.timestamp > history[1].info.timestamp);

    let limited = table.history(Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].version, 2);
}

#[tokio::test]
async fn test_update_moves_a_stale_handle_forward() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(10)]).await;
    let mut stale = location.latest().await;
    append(table, 2).await;

    assert_eq!(stale.version(), Some(0));
    stale.update().await.unwrap();
    assert_eq!(stale.version(), Some(1));
}

#[tokio::test]
async fn test_checkpoint_cleanup_expires_old_versions() {
    let location = TestTable::new();
    let configuration = BTreeMap::from([
        ("checkpoint.interval".to_string(), "2".to_string()),
        ("log.retentionHours".to_string(), "0".to_string()),
    ]);
    let (table, _) = location
        .handle()
        .write([xy_batch(&[1], &[Some(10)])])
        .with_configuration(configuration)
        .execute()
        .await
        .unwrap();
    let table = append(table, 2).await;
    let before_cleanup = table_xy(&table).await;
    let table = append(table, 3).await;
    assert_eq!(table.version(), Some(2));

    assert!(location
        .backend
        .contains(&location.object_path(&checkpoint_path(2))));
    assert!(!location.backend.contains(&location.object_path(&entry_path(0))));
    assert!(!location.backend.contains(&location.object_path(&entry_path(1))));

    let reopened = location.latest().await;
    assert_eq!(reopened.version(), Some(2));
    assert_eq!(file_set(&reopened), file_set(&table));
    let mut expected = before_cleanup;
    expected.push((3, Some(30)));
    assert_eq!(table_xy(&reopened).await, expected);

    let mut old = location.handle();
    let err = old.load_version(0).await.unwrap_err();
    assert!(matches!(err, TableError::VersionNotFound { .. }));
}

#[tokio::test]
async fn test_checkpoint_without_cleanup_keeps_every_version() {
    let location = TestTable::new();
    let configuration = BTreeMap::from([
        ("checkpoint.interval".to_string(), "1".to_string()),
        ("log.enableExpiredLogCleanup".to_string(), "false".to_string()),
    ]);
    let (table, _) = location
        .handle()
        .write([xy_batch(&[1], &[Some(10)])])
        .with_configuration(configuration)
        .execute()
        .await
        .unwrap();
    let table = append(table, 2).await;

    assert!(location
        .backend
        .contains(&location.object_path(&checkpoint_path(1))));
    let mut v0 = location.handle();
    v0.load_version(0).await.unwrap();
    assert_eq!(v0.num_files().unwrap(), 1);
    assert_eq!(table.num_files().unwrap(), 2);
}
