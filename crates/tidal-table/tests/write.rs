//! Create, save modes, partitioning and schema evolution.

use std::sync::Arc;

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use tidal_table::prelude::*;
use tidal_table::Value;
use tidal_test_utils::{region_batch, table_xy, x_batch, xy_batch, TestTable};

fn xyz_batch(xs: &[i64], zs: &[&str]) -> RecordBatch {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("x", ArrowDataType::Int64, false),
        Field::new("z", ArrowDataType::Utf8, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(xs.to_vec())),
            Arc::new(StringArray::from(zs.to_vec())),
        ],
    )
    .unwrap()
}

fn nullable_region_batch(regions: Vec<Option<&str>>, xs: &[i64]) -> RecordBatch {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("region", ArrowDataType::Utf8, true),
        Field::new("x", ArrowDataType::Int64, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(regions)),
            Arc::new(Int64Array::from(xs.to_vec())),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn test_create_commits_version_zero_without_files() {
    let location = TestTable::new();
    let schema = Schema::new(vec![
        StructField::new("id", DataType::Long, false),
        StructField::new("region", DataType::String, true),
    ])
    .unwrap();

    let table = location
        .handle()
        .create()
        .with_schema(schema.clone())
        .with_partition_columns(["region"])
        .with_name("orders")
        .with_description("order facts")
        .with_property("checkpoint.interval", "5")
        .execute()
        .await
        .unwrap();

    assert_eq!(table.version(), Some(0));
    assert_eq!(table.num_files().unwrap(), 0);
    let metadata = table.metadata().unwrap();
    assert_eq!(metadata.name.as_deref(), Some("orders"));
    assert_eq!(metadata.description.as_deref(), Some("order facts"));
    assert_eq!(metadata.partition_columns, ["region"]);
    assert_eq!(metadata.schema, schema);
    assert_eq!(table.schema().unwrap().fields().len(), 2);

    let err = location
        .handle()
        .create()
        .with_schema(schema.clone())
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::TableAlreadyExists { .. }));

    let ignored = location
        .handle()
        .create()
        .with_schema(schema)
        .with_save_mode(SaveMode::Ignore)
        .execute()
        .await
        .unwrap();
    assert_eq!(ignored.version(), Some(0));
}

#[tokio::test]
async fn test_create_rejects_bad_layouts_and_properties() {
    let location = TestTable::new();
    let schema = Schema::new(vec![StructField::new("id", DataType::Long, false)]).unwrap();

    let err = location
        .handle()
        .create()
        .with_schema(schema.clone())
        .with_partition_columns(["missing"])
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TableError::Validation { .. } | TableError::SchemaMismatch { .. }
    ));

    let err = location
        .handle()
        .create()
        .with_schema(schema)
        .with_property("checkpoint.interval", "0")
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation { .. }));
    assert!(!location.handle().is_table().await.unwrap());
}

#[tokio::test]
async fn test_save_modes_on_an_existing_table() {
    let location = TestTable::new();
    let table = location.create_xy(&[1, 2], &[Some(1), Some(2)]).await;

    let err = table
        .clone()
        .write([xy_batch(&[3], &[Some(3)])])
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::TableAlreadyExists { .. }));

    let (table, metrics) = table
        .write([xy_batch(&[3], &[Some(3)])])
        .with_save_mode(SaveMode::Ignore)
        .execute()
        .await
        .unwrap();
    assert_eq!(metrics.version, 0);
    assert_eq!(metrics.num_files, 0);

    let (table, metrics) = table
        .write([xy_batch(&[3], &[Some(3)])])
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap();
    assert_eq!(metrics.version, 1);
    assert_eq!(metrics.num_files, 1);
    assert_eq!(metrics.num_rows, 1);
    assert_eq!(table_xy(&table).await.len(), 3);

    let (table, metrics) = table
        .write([xy_batch(&[9], &[None])])
        .with_save_mode(SaveMode::Overwrite)
        .execute()
        .await
        .unwrap();
    assert_eq!(metrics.version, 2);
    assert_eq!(metrics.num_removed_files, 2);
    assert_eq!(table_xy(&table).await, vec![(9, None)]);
    assert_eq!(table.snapshot().unwrap().tombstones().count(), 2);
}

#[test]
fn test_save_mode_parsing() {
    assert_eq!("append".parse::<SaveMode>().unwrap(), SaveMode::Append);
    assert_eq!("Overwrite".parse::<SaveMode>().unwrap(), SaveMode::Overwrite);
    assert_eq!("error".parse::<SaveMode>().unwrap(), SaveMode::ErrorIfExists);
    assert!("upsert".parse::<SaveMode>().is_err());
    assert_eq!("merge".parse::<SchemaMode>().unwrap(), SchemaMode::Merge);
}

#[tokio::test]
async fn test_empty_append_does_not_commit() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(1)]).await;

    let (table, metrics) = table
        .write(Vec::<RecordBatch>::new())
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap();
    assert_eq!(metrics.version, 0);
    assert_eq!(table.version(), Some(0));

    let err = TestTable::new()
        .handle()
        .write(Vec::<RecordBatch>::new())
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation { .. }));
}

#[tokio::test]
async fn test_missing_nullable_columns_are_null_filled() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(1)]).await;

    let (table, _) = table
        .write([x_batch(&[2])])
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap();
    assert_eq!(table_xy(&table).await, vec![(1, Some(1)), (2, None)]);
}

#[tokio::test]
async fn test_incompatible_data_is_rejected() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(1)]).await;

    let err = table
        .clone()
        .write([xyz_batch(&[2], &["a"])])
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::SchemaMismatch { .. }));

    let y_only = RecordBatch::try_new(
        Arc::new(ArrowSchema::new(vec![Field::new(
            "y",
            ArrowDataType::Int64,
            true,
        )])),
        vec![Arc::new(Int64Array::from(vec![Some(5)]))],
    )
    .unwrap();
    let err = table
        .write([y_only])
        .with_save_mode(SaveMode::Append)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::SchemaMismatch { .. }));

    // nothing was committed and no stray data files remain
    let table = location.latest().await;
    assert_eq!(table.version(), Some(0));
    let data_files = location
        .backend
        .paths()
        .into_iter()
        .filter(|p| p.ends_with(".parquet"))
        .count();
    assert_eq!(data_files, 1);
}

#[tokio::test]
async fn test_schema_merge_adds_nullable_columns() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(1)]).await;

    let (table, _) = table
        .write([xyz_batch(&[2], &["b"])])
        .with_save_mode(SaveMode::Append)
        .with_schema_mode(SchemaMode::Merge)
        .execute()
        .await
        .unwrap();

    let schema = &table.metadata().unwrap().schema;
    let names: Vec<_> = schema.column_names().collect();
    assert_eq!(names, ["x", "y", "z"]);
    assert!(schema.field("z").unwrap().nullable);

    let mut rows = table.scan_rows().await.unwrap();
    rows.sort_by_key(|row| match row[0] {
        Value::Long(x) => x,
        _ => i64::MAX,
    });
    assert_eq!(
        rows,
        vec![
            vec![Value::Long(1), Value::Long(1), Value::Null],
            vec![Value::Long(2), Value::Null, Value::String("b".into())],
        ]
    );
}

#[tokio::test]
async fn test_schema_overwrite_replaces_the_schema() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(1)]).await;

    let err = table
        .clone()
        .write([xyz_batch(&[2], &["b"])])
        .with_save_mode(SaveMode::Append)
        .with_schema_mode(SchemaMode::Overwrite)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation { .. }));

    let (table, _) = table
        .write([xyz_batch(&[2], &["b"])])
        .with_save_mode(SaveMode::Overwrite)
        .with_schema_mode(SchemaMode::Overwrite)
        .execute()
        .await
        .unwrap();
    let names: Vec<_> = table
        .metadata()
        .unwrap()
        .schema
        .column_names()
        .map(str::to_string)
        .collect();
    assert_eq!(names, ["x", "z"]);
    assert_eq!(table.scan_rows().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_schema_overwrite_keeps_partition_columns() {
    let location = TestTable::new();
    let (table, _) = location
        .handle()
        .write([region_batch(&["eu"], &[1], &[Some(1)])])
        .with_partition_columns(["region"])
        .execute()
        .await
        .unwrap();

    let err = table
        .write([xy_batch(&[2], &[Some(2)])])
        .with_save_mode(SaveMode::Overwrite)
        .with_schema_mode(SchemaMode::Overwrite)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::SchemaMismatch { .. }));
}

#[tokio::test]
async fn test_partitioned_layout_on_storage() {
    let location = TestTable::new();
    let (table, metrics) = location
        .handle()
        .write([nullable_region_batch(
            vec![Some("eu"), Some("a/b"), None, Some("eu")],
            &[1, 2, 3, 4],
        )])
        .with_partition_columns(["region"])
        .execute()
        .await
        .unwrap();
    assert_eq!(metrics.num_files, 3);

    let mut prefixes: Vec<String> = table
        .snapshot()
        .unwrap()
        .files()
        .map(|f| f.path.split('/').next().unwrap().to_string())
        .collect();
    prefixes.sort();
    assert_eq!(
        prefixes,
        [
            "region=__HIVE_DEFAULT_PARTITION__",
            "region=a%2Fb",
            "region=eu"
        ]
    );
    for file in table.snapshot().unwrap().files() {
        assert!(file.path.ends_with(".parquet"));
        assert!(file.partition_values.contains_key("region"));
    }

    // partition values come back from the log, not the file
    let mut rows = table.scan_rows().await.unwrap();
    rows.sort_by_key(|row| match row[1] {
        Value::Long(x) => x,
        _ => i64::MAX,
    });
    assert_eq!(rows[1][0], Value::String("a/b".into()));
    assert_eq!(rows[2][0], Value::Null);
}

#[tokio::test]
async fn test_target_file_size_rolls_files() {
    let location = TestTable::new();
    let (table, metrics) = location
        .handle()
        .write([xy_batch(&[1, 2], &[Some(1), Some(2)]), xy_batch(&[3], &[Some(3)])])
        .with_target_file_size(1)
        .execute()
        .await
        .unwrap();
    assert_eq!(metrics.num_files, 2);
    assert_eq!(table.file_uris().unwrap().len(), 2);
    assert!(table
        .file_uris()
        .unwrap()
        .iter()
        .all(|uri| uri.starts_with("memory://warehouse/t/")));
}

#[tokio::test]
async fn test_partition_columns_must_match_an_existing_table() {
    let location = TestTable::new();
    let table = location.create_xy(&[1], &[Some(1)]).await;

    let err = table
        .write([xy_batch(&[2], &[Some(2)])])
        .with_save_mode(SaveMode::Append)
        .with_partition_columns(["x"])
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation { .. }));
}
