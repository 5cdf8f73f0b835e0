//! End to end on the local filesystem.

use tidal_table::prelude::*;
use tidal_test_utils::{table_xy, xy_batch};

#[tokio::test]
async fn test_table_round_trips_through_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("orders").display().to_string();

    let err = open_table(location.clone()).await.unwrap_err();
    assert!(matches!(err, TableError::TableNotFound { .. }));

    let (table, _) = TableBuilder::from_uri(location.clone())
        .build()
        .unwrap()
        .write([xy_batch(&[1, 2], &[Some(10), Some(20)])])
        .execute()
        .await
        .unwrap();
    assert_eq!(table.version(), Some(0));
    assert!(dir
        .path()
        .join("orders/_tidal_log/00000000000000000000.json")
        .exists());
    for uri in table.file_uris().unwrap() {
        assert!(uri.starts_with("file://"));
    }

    let source = MemorySource::try_new(vec![xy_batch(&[2, 3], &[Some(21), Some(30)])]).unwrap();
    let (_, metrics) = open_table(location.clone())
        .await
        .unwrap()
        .merge(source, "target.x = source.x")
        .with_source_alias("source")
        .with_target_alias("target")
        .when_matched_update(|u| u.update("y", "source.y"))
        .when_not_matched_insert(|i| i.set("x", "source.x").set("y", "source.y"))
        .execute()
        .await
        .unwrap();
    assert_eq!(metrics.num_target_rows_updated, 1);
    assert_eq!(metrics.num_target_rows_inserted, 1);

    let reopened = open_table(location.clone()).await.unwrap();
    assert_eq!(reopened.version(), Some(1));
    assert_eq!(
        table_xy(&reopened).await,
        vec![(1, Some(10)), (2, Some(21)), (3, Some(30))]
    );

    let original = TableBuilder::from_uri(location)
        .with_version(0)
        .load()
        .await
        .unwrap();
    assert_eq!(table_xy(&original).await, vec![(1, Some(10)), (2, Some(20))]);
}
