//! Parquet data files: partition paths, partitioned writing, reading.
//!
//! Data files hold only the non-partition columns. Partition values live in
//! the directory name and in [`AddFile::partition_values`]; readers reattach
//! them from the log, never from the path.

use std::collections::{BTreeMap, HashMap};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::Utc;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue as ParquetKeyValue;
use tidal_core::TableStorage;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::{Result, TableError};
use crate::log::{AddFile, FileStats, PartitionValues};
use crate::schema::{DataType, Schema};
use crate::value::{batch_to_rows, rows_to_batch, Row, Value};

/// Rows encoded between file size checks.
const ROWS_PER_WRITE: usize = 1024;

/// Directory value used for `NULL` partition values.
pub const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Escapes a partition value for use in a directory name.
///
/// Characters that are unsafe in object paths or ambiguous in `col=value`
/// segments become `%XX`.
#[must_use]
pub fn escape_partition_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let unsafe_char = c.is_ascii_control()
            || matches!(
                c,
                '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '{' | '}' | '[' | ']'
                    | '^'
            );
        if unsafe_char {
            out.push_str(&format!("%{:02X}", u32::from(c)));
        } else {
            out.push(c);
        }
    }
    out
}

/// Builds the `col=value/` directory prefix for a partition.
#[must_use]
pub fn partition_prefix(partition_columns: &[String], values: &PartitionValues) -> String {
    partition_columns
        .iter()
        .map(|column| {
            let value = values
                .get(column)
                .and_then(Option::as_deref)
                .map_or_else(|| NULL_PARTITION.to_string(), escape_partition_value);
            format!("{}={value}/", escape_partition_value(column))
        })
        .collect()
}

/// Returns a fresh data file path under `prefix`.
#[must_use]
pub fn new_data_file_path(prefix: &str) -> String {
    format!("{prefix}part-{}.parquet", Ulid::new())
}

fn writer_properties() -> WriterProperties {
    let created_by = ParquetKeyValue {
        key: "created_by".to_string(),
        value: Some(crate::log::ENGINE_INFO.to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

/// Per-column statistics accumulated while writing one file.
#[derive(Debug)]
struct StatsCollector {
    columns: Vec<(String, DataType)>,
    num_records: u64,
    null_count: Vec<u64>,
    min: Vec<Option<Value>>,
    max: Vec<Option<Value>>,
}

impl StatsCollector {
    fn new(columns: Vec<(String, DataType)>) -> Self {
        let n = columns.len();
        Self {
            columns,
            num_records: 0,
            null_count: vec![0; n],
            min: vec![None; n],
            max: vec![None; n],
        }
    }

    fn update(&mut self, rows: &[Row], indices: &[usize]) {
        self.num_records += rows.len() as u64;
        for (slot, &index) in indices.iter().enumerate() {
            let orderable = !matches!(self.columns[slot].1, DataType::Binary);
            for row in rows {
                let value = &row[index];
                if value.is_null() {
                    self.null_count[slot] += 1;
                    continue;
                }
                if !orderable {
                    continue;
                }
                if self.min[slot]
                    .as_ref()
                    .is_none_or(|m| value.compare(m) == Some(std::cmp::Ordering::Less))
                {
                    self.min[slot] = Some(value.clone());
                }
                if self.max[slot]
                    .as_ref()
                    .is_none_or(|m| value.compare(m) == Some(std::cmp::Ordering::Greater))
                {
                    self.max[slot] = Some(value.clone());
                }
            }
        }
    }

    fn finish(self) -> FileStats {
        let mut stats = FileStats {
            num_records: self.num_records,
            ..FileStats::default()
        };
        for (slot, (name, _)) in self.columns.into_iter().enumerate() {
            stats.null_count.insert(name.clone(), self.null_count[slot]);
            if let Some(min) = self.min[slot].as_ref().and_then(Value::to_partition_value) {
                stats.min_values.insert(name.clone(), min);
            }
            if let Some(max) = self.max[slot].as_ref().and_then(Value::to_partition_value) {
                stats.max_values.insert(name, max);
            }
        }
        stats
    }
}

struct OpenFile {
    values: PartitionValues,
    writer: ArrowWriter<Vec<u8>>,
    stats: StatsCollector,
}

/// Writes rows into per-partition Parquet files of roughly
/// `target_file_size` bytes.
pub struct PartitionedWriter {
    storage: TableStorage,
    schema: Schema,
    partition_columns: Vec<String>,
    partition_indices: Vec<usize>,
    data_indices: Vec<usize>,
    file_schema: SchemaRef,
    target_file_size: u64,
    data_change: bool,
    open: HashMap<Vec<Option<String>>, OpenFile>,
    written: Vec<AddFile>,
}

impl std::fmt::Debug for PartitionedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedWriter")
            .field("partition_columns", &self.partition_columns)
            .field("target_file_size", &self.target_file_size)
            .field("open_files", &self.open.len())
            .field("written", &self.written.len())
            .finish_non_exhaustive()
    }
}

impl PartitionedWriter {
    /// Creates a writer for rows laid out by `schema`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a partition column is not in the schema.
    pub fn new(
        storage: TableStorage,
        schema: Schema,
        partition_columns: Vec<String>,
        target_file_size: u64,
    ) -> Result<Self> {
        let partition_indices = partition_columns
            .iter()
            .map(|c| {
                schema.index_of(c).ok_or_else(|| {
                    TableError::validation(format!("partition column `{c}` is not in the schema"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let data_indices = (0..schema.fields().len())
            .filter(|i| !partition_indices.contains(i))
            .collect();
        let file_schema = schema.to_arrow_without(&partition_columns);
        Ok(Self {
            storage,
            schema,
            partition_columns,
            partition_indices,
            data_indices,
            file_schema,
            target_file_size: target_file_size.max(1),
            data_change: true,
            open: HashMap::new(),
            written: Vec::new(),
        })
    }

    /// Sets the data-change flag of produced files.
    #[must_use]
    pub fn with_data_change(mut self, data_change: bool) -> Self {
        self.data_change = data_change;
        self
    }

    /// Writes a record batch, matching columns by name.
    ///
    /// # Errors
    ///
    /// Returns conversion, Parquet, and storage errors.
    pub async fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let rows = batch_to_rows(batch, &self.schema)?;
        self.write_rows(rows).await
    }

    /// Writes rows laid out by the writer's schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` for values that do not fit their column,
    /// and Parquet or storage errors.
    pub async fn write_rows(&mut self, rows: Vec<Row>) -> Result<()> {
        let mut groups: BTreeMap<Vec<Option<String>>, Vec<Row>> = BTreeMap::new();
        for row in rows {
            let key = self
                .partition_indices
                .iter()
                .map(|&i| {
                    let field = &self.schema.fields()[i];
                    let value = row[i].cast_to(&field.data_type)?;
                    if value.is_null() && !field.nullable {
                        return Err(TableError::schema_mismatch(format!(
                            "column `{}` is not nullable but received NULL",
                            field.name
                        )));
                    }
                    Ok(value.to_partition_value())
                })
                .collect::<Result<Vec<_>>>()?;
            groups.entry(key).or_default().push(row);
        }

        for (key, rows) in groups {
            for chunk in rows.chunks(ROWS_PER_WRITE) {
                let batch = rows_to_batch(chunk, &self.schema, &self.data_indices)?;
                let file = match self.open.entry(key.clone()) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        let values = self
                            .partition_columns
                            .iter()
                            .cloned()
                            .zip(key.iter().cloned())
                            .collect();
                        let columns = self
                            .data_indices
                            .iter()
                            .map(|&i| {
                                let f = &self.schema.fields()[i];
                                (f.name.clone(), f.data_type)
                            })
                            .collect();
                        e.insert(OpenFile {
                            values,
                            writer: ArrowWriter::try_new(
                                Vec::new(),
                                self.file_schema.clone(),
                                Some(writer_properties()),
                            )?,
                            stats: StatsCollector::new(columns),
                        })
                    }
                };
                file.writer.write(&batch)?;
                file.stats.update(chunk, &self.data_indices);
                let size = file.writer.bytes_written() + file.writer.in_progress_size();
                if size as u64 >= self.target_file_size {
                    if let Some(file) = self.open.remove(&key) {
                        self.flush(file).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn flush(&mut self, file: OpenFile) -> Result<()> {
        let OpenFile {
            values,
            writer,
            stats,
        } = file;
        let bytes = Bytes::from(writer.into_inner()?);
        let path = new_data_file_path(&partition_prefix(&self.partition_columns, &values));
        let size = bytes.len() as u64;
        self.storage
            .put(&path, bytes, tidal_core::WritePrecondition::None)
            .await?;
        debug!(path = %path, size, "data file written");
        self.written.push(AddFile {
            path,
            size,
            partition_values: values,
            modification_time: Utc::now().timestamp_millis(),
            data_change: self.data_change,
            stats: Some(stats.finish()),
            added_version: None,
        });
        Ok(())
    }

    /// Schema of the rows the writer accepts.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Paths written so far.
    pub fn written_paths(&self) -> impl Iterator<Item = &str> {
        self.written.iter().map(|a| a.path.as_str())
    }

    /// Flushes open files and returns every file written.
    ///
    /// # Errors
    ///
    /// Returns Parquet or storage errors.
    pub async fn close(mut self) -> Result<Vec<AddFile>> {
        self.flush_open().await?;
        Ok(self.written)
    }

    /// Flushes every open file, keeping the writer usable.
    ///
    /// # Errors
    ///
    /// Returns Parquet or storage errors.
    pub async fn flush_open(&mut self) -> Result<()> {
        let mut open: Vec<_> = self.open.drain().collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, file) in open {
            self.flush(file).await?;
        }
        Ok(())
    }

    /// Deletes every file written so far. Failures are logged.
    pub async fn discard(&mut self) {
        self.open.clear();
        for add in self.written.drain(..) {
            if let Err(e) = self.storage.delete(&add.path).await {
                warn!(path = %add.path, error = %e, "failed to delete discarded data file");
            }
        }
    }
}

/// Reads a data file as rows laid out by `schema`, reattaching partition
/// values. Columns absent from the file read as `NULL`.
///
/// # Errors
///
/// Returns storage, Parquet, and conversion errors.
pub async fn read_rows(
    storage: &TableStorage,
    file: &AddFile,
    schema: &Schema,
    partition_columns: &[String],
) -> Result<Vec<Row>> {
    let bytes = storage.get(&file.path).await?;
    let partition_values = partition_columns
        .iter()
        .filter_map(|column| schema.index_of(column).map(|i| (i, column)))
        .map(|(i, column)| {
            let raw = file.partition_values.get(column).and_then(Option::as_deref);
            Ok((i, Value::from_partition_value(raw, &schema.fields()[i].data_type)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        let mut batch_rows = batch_to_rows(&batch?, schema)?;
        for row in &mut batch_rows {
            for (i, value) in &partition_values {
                row[*i] = value.clone();
            }
        }
        rows.extend(batch_rows);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tidal_core::MemoryBackend;

    use super::*;
    use crate::schema::StructField;

    fn storage() -> TableStorage {
        TableStorage::new(Arc::new(MemoryBackend::new()), "t", "memory://b/t")
    }

    fn schema() -> Schema {
        Schema::new(vec![
            StructField::new("id", DataType::Long, false),
            StructField::new("region", DataType::String, true),
        ])
        .unwrap()
    }

    #[test]
    fn test_partition_paths_escape_and_null() {
        let values = BTreeMap::from([
            ("a".to_string(), Some("x/y=1".to_string())),
            ("b".to_string(), None),
        ]);
        assert_eq!(
            partition_prefix(&["a".into(), "b".into()], &values),
            "a=x%2Fy%3D1/b=__HIVE_DEFAULT_PARTITION__/"
        );
        assert_eq!(escape_partition_value("50%"), "50%25");
        assert_eq!(escape_partition_value("café"), "café");
        assert!(new_data_file_path("a=1/").starts_with("a=1/part-"));
    }

    #[tokio::test]
    async fn test_partitioned_write_and_read_back() {
        let storage = storage();
        let mut writer =
            PartitionedWriter::new(storage.clone(), schema(), vec!["region".into()], u64::MAX).unwrap();
        writer
            .write_rows(vec![
                vec![Value::Long(1), Value::from("eu")],
                vec![Value::Long(2), Value::from("us")],
                vec![Value::Long(3), Value::from("eu")],
                vec![Value::Long(4), Value::Null],
            ])
            .await
            .unwrap();
        let files = writer.close().await.unwrap();
        assert_eq!(files.len(), 3);

        let eu = files
            .iter()
            .find(|f| f.partition_values["region"].as_deref() == Some("eu"))
            .unwrap();
        assert!(eu.path.starts_with("region=eu/part-"));
        let stats = eu.stats.as_ref().unwrap();
        assert_eq!(stats.num_records, 2);
        assert_eq!(stats.min_values["id"], "1");
        assert_eq!(stats.max_values["id"], "3");
        assert!(!stats.null_count.contains_key("region"));

        let rows = read_rows(&storage, eu, &schema(), &["region".into()]).await.unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Long(1), Value::from("eu")],
                vec![Value::Long(3), Value::from("eu")],
            ]
        );

        let null_file = files
            .iter()
            .find(|f| f.partition_values["region"].is_none())
            .unwrap();
        assert!(null_file.path.starts_with("region=__HIVE_DEFAULT_PARTITION__/"));
        let rows = read_rows(&storage, null_file, &schema(), &["region".into()]).await.unwrap();
        assert_eq!(rows, vec![vec![Value::Long(4), Value::Null]]);
    }

    #[tokio::test]
    async fn test_small_target_rolls_files() {
        let mut writer = PartitionedWriter::new(storage(), schema(), Vec::new(), 1).unwrap();
        for id in 0..3 {
            writer
                .write_rows(vec![vec![Value::Long(id), Value::from("eu")]])
                .await
                .unwrap();
        }
        let files = writer.close().await.unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| f.num_records() == Some(1)));
    }

    #[tokio::test]
    async fn test_one_large_write_is_split_at_the_target_size() {
        let storage = storage();
        let mut writer = PartitionedWriter::new(storage.clone(), schema(), Vec::new(), 1).unwrap();
        let rows = (0..2500).map(|id| vec![Value::Long(id), Value::from("eu")]).collect();
        writer.write_rows(rows).await.unwrap();
        let files = writer.close().await.unwrap();

        let counts: Vec<_> = files.iter().map(|f| f.num_records().unwrap()).collect();
        assert_eq!(counts, vec![1024, 1024, 452]);
        let mut total = 0;
        for file in &files {
            total += read_rows(&storage, file, &schema(), &[]).await.unwrap().len();
        }
        assert_eq!(total, 2500);
    }

    #[tokio::test]
    async fn test_discard_deletes_written_files() {
        let storage = storage();
        let mut writer = PartitionedWriter::new(storage.clone(), schema(), Vec::new(), 1).unwrap();
        writer
            .write_rows(vec![vec![Value::Long(1), Value::from("eu")]])
            .await
            .unwrap();
        assert_eq!(writer.written_paths().count(), 1);
        writer.discard().await;
        assert_eq!(writer.written_paths().count(), 0);
        assert!(storage.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_null_in_required_column_is_schema_mismatch() {
        let mut writer = PartitionedWriter::new(storage(), schema(), Vec::new(), u64::MAX).unwrap();
        let err = writer
            .write_rows(vec![vec![Value::Null, Value::from("eu")]])
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
    }
}
