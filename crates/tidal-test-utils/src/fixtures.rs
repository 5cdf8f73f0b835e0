//! Tables, batches and clocks for integration tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, SchemaRef};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tidal_core::{EngineConfig, StorageBackend, TableStorage};
use tidal_table::operations::vacuum::Clock;
use tidal_table::value::{Row, Value};
use tidal_table::{Table, TableBuilder};

use crate::storage::TracingMemoryBackend;

/// A table location backed by a shared [`TracingMemoryBackend`].
///
/// Every handle from [`TestTable::handle`] sees the same objects, so several
/// handles behave like independent writers on one table.
#[derive(Debug, Clone)]
pub struct TestTable {
    /// Backend holding the table.
    pub backend: TracingMemoryBackend,
    /// Engine configuration for new handles.
    pub config: EngineConfig,
    prefix: String,
}

impl TestTable {
    /// A fresh empty location.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(TracingMemoryBackend::new())
    }

    /// A location on an existing backend.
    #[must_use]
    pub fn with_backend(backend: TracingMemoryBackend) -> Self {
        Self {
            backend,
            config: EngineConfig::default(),
            prefix: "warehouse/t".to_string(),
        }
    }

    /// Replaces the engine configuration used for new handles.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Backend path of a table-relative path.
    #[must_use]
    pub fn object_path(&self, relative: &str) -> String {
        format!("{}/{relative}", self.prefix)
    }

    /// Table storage scoped to this location.
    #[must_use]
    pub fn storage(&self) -> TableStorage {
        let backend: Arc<dyn StorageBackend> = Arc::new(self.backend.clone());
        TableStorage::new(backend, self.prefix.clone(), format!("memory://{}", self.prefix))
    }

    /// A handle with nothing loaded.
    #[must_use]
    pub fn handle(&self) -> Table {
        TableBuilder::from_storage(self.storage())
            .with_config(self.config.clone())
            .build()
            .expect("storage is already resolved")
    }

    /// A handle loaded at the latest version.
    pub async fn latest(&self) -> Table {
        TableBuilder::from_storage(self.storage())
            .with_config(self.config.clone())
            .load()
            .await
            .expect("table exists")
    }

    /// Creates the table from `x`/`y` rows in one data file.
    pub async fn create_xy(&self, xs: &[i64], ys: &[Option<i64>]) -> Table {
        let (table, _) = self
            .handle()
            .write([xy_batch(xs, ys)])
            .execute()
            .await
            .expect("initial write");
        table
    }
}

impl Default for TestTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Schema `x: long not null, y: long`.
#[must_use]
pub fn xy_schema() -> SchemaRef {
    Arc::new(ArrowSchema::new(vec![
        Field::new("x", ArrowDataType::Int64, false),
        Field::new("y", ArrowDataType::Int64, true),
    ]))
}

/// Batch in [`xy_schema`].
///
/// # Panics
///
/// Panics if the columns differ in length.
#[must_use]
pub fn xy_batch(xs: &[i64], ys: &[Option<i64>]) -> RecordBatch {
    assert_eq!(xs.len(), ys.len(), "x and y lengths differ");
    RecordBatch::try_new(
        xy_schema(),
        vec![
            Arc::new(Int64Array::from(xs.to_vec())),
            Arc::new(Int64Array::from(ys.to_vec())),
        ],
    )
    .expect("valid batch")
}

/// Batch with a single non-null `x` column.
#[must_use]
pub fn x_batch(xs: &[i64]) -> RecordBatch {
    let schema = Arc::new(ArrowSchema::new(vec![Field::new(
        "x",
        ArrowDataType::Int64,
        false,
    )]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(xs.to_vec()))])
        .expect("valid batch")
}

/// Batch `(region: string not null, x: long not null, y: long)`, handy for
/// partitioned tables.
#[must_use]
pub fn region_batch(regions: &[&str], xs: &[i64], ys: &[Option<i64>]) -> RecordBatch {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("region", ArrowDataType::Utf8, false),
        Field::new("x", ArrowDataType::Int64, false),
        Field::new("y", ArrowDataType::Int64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(regions.to_vec())),
            Arc::new(Int64Array::from(xs.to_vec())),
            Arc::new(Int64Array::from(ys.to_vec())),
        ],
    )
    .expect("valid batch")
}

/// Extracts `(x, y)` pairs from rows whose first two columns are longs,
/// sorted by `x`.
#[must_use]
pub fn sorted_xy(rows: &[Row]) -> Vec<(i64, Option<i64>)> {
    let long = |value: &Value| match value {
        Value::Long(v) => Some(*v),
        Value::Null => None,
        other => panic!("expected long, got {other:?}"),
    };
    let mut pairs: Vec<_> = rows
        .iter()
        .map(|row| (long(&row[0]).expect("x is not null"), long(&row[1])))
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Scans the table and returns its `(x, y)` pairs sorted by `x`.
pub async fn table_xy(table: &Table) -> Vec<(i64, Option<i64>)> {
    sorted_xy(&table.scan_rows().await.expect("scan"))
}

/// Manually advanced clock.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    millis: Arc<AtomicI64>,
}

impl SimulatedClock {
    /// A clock reading `start`.
    #[must_use]
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Current reading.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .expect("clock stays in range")
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// The clock in the form vacuum accepts.
    #[must_use]
    pub fn as_clock(&self) -> Clock {
        let this = self.clone();
        Arc::new(move || this.now())
    }
}
