//! Property-based tests for merge accounting, vacuum retention and
//! snapshot stability.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use tidal_table::prelude::*;
use tidal_test_utils::{table_xy, xy_batch, SimulatedClock, TestTable};

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

/// Distinct keys with a value each.
fn arb_rows(max: usize) -> impl Strategy<Value = BTreeMap<i64, i64>> {
    prop::collection::btree_map(0i64..40, -50i64..50, 1..max)
}

fn split(rows: &BTreeMap<i64, i64>) -> (Vec<i64>, Vec<Option<i64>>) {
    (rows.keys().copied().collect(), rows.values().map(|&y| Some(y)).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every matched row is updated or deleted, every unmatched source row
    /// is inserted, and the remaining target rows are copied or untouched.
    #[test]
    fn merge_metrics_account_for_every_row(
        target in arb_rows(12),
        source in arb_rows(12),
        threshold in -50i64..50,
    ) {
        let (metrics, after) = block_on(async {
            let location = TestTable::new();
            let (xs, ys) = split(&target);
            let table = location.create_xy(&xs, &ys).await;
            let (sx, sy) = split(&source);
            let source_rows = MemorySource::try_new(vec![xy_batch(&sx, &sy)]).unwrap();
            let (table, metrics) = table
                .merge(source_rows, "target.x = source.x")
                .when_matched_update(|u| {
                    u.predicate(format!("source.y > {threshold}")).update("y", "source.y")
                })
                .when_matched_delete(|d| d)
                .when_not_matched_insert(|i| i.set("x", "source.x").set("y", "source.y"))
                .execute()
                .await
                .unwrap();
            (metrics, table_xy(&table).await)
        });

        let matched: BTreeSet<i64> = target
            .keys()
            .filter(|k| source.contains_key(k))
            .copied()
            .collect();
        let inserted = source.len() - matched.len();
        let updated = matched.iter().filter(|k| source[*k] > threshold).count();

        prop_assert_eq!(metrics.num_target_rows_updated, updated as u64);
        prop_assert_eq!(metrics.num_target_rows_deleted, (matched.len() - updated) as u64);
        prop_assert_eq!(metrics.num_target_rows_inserted, inserted as u64);
        // the target lives in one file, rewritten whenever anything matched
        let touched_rows = if matched.is_empty() { 0 } else { target.len() as u64 };
        prop_assert_eq!(
            metrics.num_target_rows_updated
                + metrics.num_target_rows_deleted
                + metrics.num_target_rows_copied,
            touched_rows
        );
        prop_assert_eq!(
            after.len(),
            target.len() - (matched.len() - updated) + inserted
        );
        for (x, y) in after {
            let expected = match (target.get(&x), source.get(&x)) {
                (Some(_), Some(&s)) => s,
                (Some(&t), None) => t,
                (None, Some(&s)) => s,
                (None, None) => unreachable!("row {x} came from nowhere"),
            };
            prop_assert_eq!(y, Some(expected));
        }
    }

    /// A tombstone is reclaimed only once its removal is older than the
    /// retention window.
    #[test]
    fn vacuum_respects_the_retention_window(
        retention_hours in 0i64..400,
        clock_offset_hours in 0i64..400,
        dry_run in any::<bool>(),
    ) {
        prop_assume!(retention_hours != clock_offset_hours);
        let (deleted, still_stored) = block_on(async {
            let location = TestTable::new();
            let table = location.create_xy(&[1], &[Some(1)]).await;
            let removed = table.snapshot().unwrap().files().next().unwrap().path.clone();
            let (table, _) = table
                .write([xy_batch(&[2], &[Some(2)])])
                .with_save_mode(SaveMode::Overwrite)
                .execute()
                .await
                .unwrap();

            let clock = SimulatedClock::at(Utc::now() + Duration::hours(clock_offset_hours));
            location.backend.clear_operations();
            let (_, metrics) = table
                .vacuum()
                .with_retention_hours(retention_hours)
                .with_enforce_retention(false)
                .with_dry_run(dry_run)
                .with_clock(clock.as_clock())
                .execute()
                .await
                .unwrap();
            if dry_run {
                assert!(location.backend.mutations().is_empty());
            }
            let stored = location.backend.contains(&location.object_path(&removed));
            (metrics.files_deleted, stored)
        });

        let expired = clock_offset_hours > retention_hours;
        prop_assert_eq!(deleted.len(), usize::from(expired));
        prop_assert_eq!(still_stored, dry_run || !expired);
    }

    /// Loading a version gives the same files no matter how many commits
    /// follow it.
    #[test]
    fn loading_a_version_is_repeatable(
        appends in 1usize..6,
        pick in 0usize..6,
    ) {
        let (first, second) = block_on(async {
            let location = TestTable::new();
            let mut table = location.create_xy(&[0], &[Some(0)]).await;
            let version = (pick % (appends + 1)) as u64;
            let mut early = None;
            for x in 1..=appends as i64 {
                if table.version() == Some(version) {
                    early = Some(location.latest().await);
                }
                table = table
                    .write([xy_batch(&[x], &[Some(x)])])
                    .with_save_mode(SaveMode::Append)
                    .execute()
                    .await
                    .unwrap()
                    .0;
            }
            let files = |t: &Table| -> BTreeSet<String> {
                t.snapshot().unwrap().files().map(|f| f.path.clone()).collect()
            };
            let mut later = location.handle();
            later.load_version(version).await.unwrap();
            let early = early.unwrap_or_else(|| table.clone());
            (files(&early), files(&later))
        });
        prop_assert_eq!(first, second);
    }
}
