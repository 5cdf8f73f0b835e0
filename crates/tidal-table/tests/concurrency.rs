//! Optimistic concurrency: racing writers and the commit retry loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tidal_core::EngineConfig;
use tidal_table::commit::{CommitPlanner, Committer, Operation, Planned, PreparedCommit};
use tidal_table::log::Action;
use tidal_table::prelude::*;
use tidal_table::Snapshot;
use tidal_test_utils::{table_xy, xy_batch, StorageOp, TestTable, TracingMemoryBackend};

/// Commits an empty append and records the versions it planned against.
/// Every attempt writes one scratch file listed as an attempt file.
struct ScratchPlanner {
    storage: tidal_core::TableStorage,
    seen: Vec<u64>,
    extra: Vec<Action>,
}

#[async_trait]
impl CommitPlanner for ScratchPlanner {
    type Output = ();

    async fn plan(&mut self, snapshot: Option<&Arc<Snapshot>>) -> Result<Planned<()>> {
        let version = snapshot.map_or(0, |s| s.version());
        self.seen.push(version);
        let scratch = format!("scratch-{}.parquet", self.seen.len());
        self.storage
            .create_if_absent(&scratch, Bytes::from_static(b"x"))
            .await?;
        let mut prepared = PreparedCommit::new(Operation::Write {
            mode: SaveMode::Append,
            partition_by: Vec::new(),
            schema_mode: None,
        });
        prepared.actions.extend(self.extra.iter().cloned());
        prepared.attempt_files.push(scratch);
        Ok(Planned::Commit(prepared, ()))
    }
}

#[tokio::test]
async fn test_concurrent_appends_each_get_a_distinct_version() {
    let location =
        TestTable::with_backend(TracingMemoryBackend::with_latency(Duration::from_millis(1)));
    location.create_xy(&[0], &[Some(0)]).await;

    let writers = (1..=6).map(|x| {
        let handle = location.handle();
        async move {
            handle
                .write([xy_batch(&[x], &[Some(x)])])
                .with_save_mode(SaveMode::Append)
                .execute()
                .await
        }
    });
    let results = join_all(writers).await;

    let mut versions: Vec<u64> = results
        .into_iter()
        .map(|r| r.unwrap().1.version)
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, [1, 2, 3, 4, 5, 6]);

    let table = location.latest().await;
    assert_eq!(table.version(), Some(6));
    let xs: Vec<i64> = table_xy(&table).await.into_iter().map(|(x, _)| x).collect();
    assert_eq!(xs, [0, 1, 2, 3, 4, 5, 6]);

    let history = table.history(None).await.unwrap();
    assert_eq!(history.len(), 7);
}

#[tokio::test]
async fn test_lost_race_replans_against_the_new_head() {
    let location = TestTable::new();
    let stale = location.create_xy(&[1], &[Some(1)]).await;
    let base = stale.snapshot().unwrap().clone();
    // another writer takes version 1
    location
        .handle()
        .write([xy_batch(&[2], &[Some(2)])])
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap();

    let mut planner = ScratchPlanner {
        storage: location.storage(),
        seen: Vec::new(),
        extra: Vec::new(),
    };
    let committed = Committer::new(stale.log(), stale.config())
        .run(Some(base), &mut planner)
        .await
        .unwrap();

    assert!(committed.committed);
    assert_eq!(committed.snapshot.unwrap().version(), 2);
    assert_eq!(planner.seen, [0, 1]);
    // the losing attempt's file is gone, the winner's stays
    assert!(!location
        .backend
        .contains(&location.object_path("scratch-1.parquet")));
    assert!(location
        .backend
        .contains(&location.object_path("scratch-2.parquet")));
}

#[tokio::test]
async fn test_attempts_are_bounded() {
    let location = TestTable::new().with_config(EngineConfig {
        max_commit_attempts: 1,
        ..EngineConfig::default()
    });
    let stale = location.create_xy(&[1], &[Some(1)]).await;
    let base = stale.snapshot().unwrap().clone();
    location
        .handle()
        .write([xy_batch(&[2], &[Some(2)])])
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap();

    let mut planner = ScratchPlanner {
        storage: location.storage(),
        seen: Vec::new(),
        extra: Vec::new(),
    };
    let err = Committer::new(stale.log(), stale.config())
        .run(Some(base), &mut planner)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TableError::ConcurrentModificationExceeded { attempts: 1 }
    ));
    assert_eq!(location.latest().await.version(), Some(1));
}

#[tokio::test]
async fn test_log_entries_are_written_create_if_absent() {
    let location = TestTable::new();
    location.create_xy(&[1], &[Some(1)]).await;

    let entry_puts: Vec<_> = location
        .backend
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            StorageOp::Put {
                path, precondition, ..
            } if path.contains("_tidal_log/") => Some(precondition),
            _ => None,
        })
        .collect();
    assert_eq!(
        entry_puts,
        [tidal_core::WritePrecondition::DoesNotExist]
    );
}

#[tokio::test]
async fn test_readers_keep_their_snapshot_while_writers_commit() {
    let location = TestTable::new();
    let reader = location.create_xy(&[1], &[Some(1)]).await;

    location
        .handle()
        .write([xy_batch(&[2], &[Some(2)])])
        .with_save_mode(SaveMode::Overwrite)
        .execute()
        .await
        .unwrap();

    assert_eq!(reader.version(), Some(0));
    assert_eq!(table_xy(&reader).await, vec![(1, Some(1))]);
}

#[tokio::test]
async fn test_concurrent_merges_on_one_file_keep_every_update() {
    let location =
        TestTable::with_backend(TracingMemoryBackend::with_latency(Duration::from_millis(1)));
    location
        .create_xy(&[1, 2, 3, 4], &[Some(1), Some(2), Some(3), Some(4)])
        .await;

    let mergers = (1..=4).map(|x| {
        let handle = location.handle();
        async move {
            let source = MemorySource::try_new(vec![xy_batch(&[x], &[Some(x * 10)])])?;
            handle
                .merge(source, "target.x = source.x")
                .when_matched_update(|u| u.update("y", "source.y"))
                .execute()
                .await
        }
    });
    for result in join_all(mergers).await {
        assert_eq!(result.unwrap().1.num_target_rows_updated, 1);
    }

    let table = location.latest().await;
    assert_eq!(table.version(), Some(4));
    assert_eq!(
        table_xy(&table).await,
        vec![(1, Some(10)), (2, Some(20)), (3, Some(30)), (4, Some(40))]
    );
    assert_eq!(table.num_files().unwrap(), 1);
}

#[tokio::test]
async fn test_stale_merge_applies_on_top_of_the_rewritten_file() {
    let location = TestTable::new();
    let stale = location.create_xy(&[1, 2], &[Some(1), Some(2)]).await;
    // another writer rewrites the only file
    location
        .latest()
        .await
        .merge(
            MemorySource::try_new(vec![xy_batch(&[1], &[Some(100)])]).unwrap(),
            "target.x = source.x",
        )
        .when_matched_update(|u| u.update("y", "source.y"))
        .execute()
        .await
        .unwrap();

    let (table, metrics) = stale
        .merge(
            MemorySource::try_new(vec![xy_batch(&[2], &[Some(200)])]).unwrap(),
            "target.x = source.x",
        )
        .when_matched_update(|u| u.update("y", "source.y"))
        .execute()
        .await
        .unwrap();

    assert_eq!(metrics.num_target_rows_updated, 1);
    assert_eq!(table.version(), Some(2));
    assert_eq!(table_xy(&table).await, vec![(1, Some(100)), (2, Some(200))]);
    let history = table.history(Some(1)).await.unwrap();
    assert_eq!(history[0].info.read_version, Some(1));
}

#[tokio::test]
async fn test_failed_commit_deletes_attempt_files() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(1)]).await;
    let base = table.snapshot().unwrap().clone();
    let scratch = location.object_path("scratch-1.parquet");

    // the log entry cannot be written
    location
        .backend
        .inject_failure(location.object_path("_tidal_log/"));
    let mut planner = ScratchPlanner {
        storage: location.storage(),
        seen: Vec::new(),
        extra: Vec::new(),
    };
    let err = Committer::new(table.log(), table.config())
        .run(Some(base.clone()), &mut planner)
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Storage(_)));
    assert!(!location.backend.contains(&scratch));
    location.backend.clear_failures();

    // the actions are rejected before the log is touched
    let active = base.files().next().unwrap().clone();
    let mut planner = ScratchPlanner {
        storage: location.storage(),
        seen: Vec::new(),
        extra: vec![Action::Add(active)],
    };
    let err = Committer::new(table.log(), table.config())
        .run(Some(base), &mut planner)
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation { .. }));
    assert!(!location.backend.contains(&scratch));
    assert_eq!(location.latest().await.version(), Some(0));
}
