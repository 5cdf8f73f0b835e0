//! Writing record batches: save modes, partitioning, schema evolution.
//!
//! Data files are written once, before the commit loop. Each commit attempt
//! only re-derives the metadata and removal actions against the refreshed
//! snapshot, so a lost race never rewrites data.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tidal_core::observability::table_span;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::commit::{elapsed_ms, CommitPlanner, Committer, Operation, Planned, PreparedCommit};
use crate::data_files::PartitionedWriter;
use crate::error::{Result, TableError};
use crate::log::{Action, AddFile, Metadata};
use crate::metrics;
use crate::properties::TableProperties;
use crate::schema::Schema;
use crate::snapshot::Snapshot;
use crate::table::Table;

/// What to do when the table already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Fail with `TableAlreadyExists`.
    #[default]
    ErrorIfExists,
    /// Add the data to the table.
    Append,
    /// Replace the table's data.
    Overwrite,
    /// Leave the table untouched.
    Ignore,
}

impl SaveMode {
    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrorIfExists => "ErrorIfExists",
            Self::Append => "Append",
            Self::Overwrite => "Overwrite",
            Self::Ignore => "Ignore",
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaveMode {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "errorifexists" => Ok(Self::ErrorIfExists),
            "append" => Ok(Self::Append),
            "overwrite" => Ok(Self::Overwrite),
            "ignore" => Ok(Self::Ignore),
            other => Err(TableError::validation(format!("unknown save mode `{other}`"))),
        }
    }
}

/// How the write may change the table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    /// Add new incoming columns as nullable.
    Merge,
    /// Replace the schema with the incoming one; requires `Overwrite`.
    Overwrite,
}

impl SchemaMode {
    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Overwrite => "overwrite",
        }
    }
}

impl FromStr for SchemaMode {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(TableError::validation(format!("unknown schema mode `{other}`"))),
        }
    }
}

/// Outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteMetrics {
    /// Table version after the write.
    pub version: u64,
    /// Data files added.
    pub num_files: usize,
    /// Rows written.
    pub num_rows: u64,
    /// Files removed by an overwrite.
    pub num_removed_files: usize,
}

/// Writes record batches to a table, creating it if needed.
pub struct WriteBuilder {
    table: Table,
    input: BoxStream<'static, Result<RecordBatch>>,
    mode: SaveMode,
    partition_by: Option<Vec<String>>,
    schema_mode: Option<SchemaMode>,
    name: Option<String>,
    description: Option<String>,
    configuration: BTreeMap<String, String>,
    target_file_size: Option<u64>,
}

impl fmt::Debug for WriteBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBuilder")
            .field("uri", &self.table.uri())
            .field("mode", &self.mode)
            .field("partition_by", &self.partition_by)
            .field("schema_mode", &self.schema_mode)
            .finish_non_exhaustive()
    }
}

impl WriteBuilder {
    pub(crate) fn new(table: Table, batches: impl IntoIterator<Item = RecordBatch>) -> Self {
        let batches: Vec<_> = batches.into_iter().map(Ok).collect();
        Self {
            table,
            input: futures::stream::iter(batches).boxed(),
            mode: SaveMode::ErrorIfExists,
            partition_by: None,
            schema_mode: None,
            name: None,
            description: None,
            configuration: BTreeMap::new(),
            target_file_size: None,
        }
    }

    /// Replaces the input with a stream of batches.
    #[must_use]
    pub fn with_input_stream(mut self, input: BoxStream<'static, Result<RecordBatch>>) -> Self {
        self.input = input;
        self
    }

    /// Save mode; defaults to `ErrorIfExists`.
    #[must_use]
    pub fn with_save_mode(mut self, mode: SaveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Partition columns. For existing tables they must match.
    #[must_use]
    pub fn with_partition_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.partition_by = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Schema evolution mode.
    #[must_use]
    pub fn with_schema_mode(mut self, mode: SchemaMode) -> Self {
        self.schema_mode = Some(mode);
        self
    }

    /// Name recorded if the write creates the table.
    #[must_use]
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Description recorded if the write creates the table.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Properties recorded if the write creates the table.
    #[must_use]
    pub fn with_configuration(mut self, configuration: BTreeMap<String, String>) -> Self {
        self.configuration = configuration;
        self
    }

    /// Overrides the engine's target file size.
    #[must_use]
    pub fn with_target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = Some(bytes);
        self
    }

    /// Writes the data and commits.
    ///
    /// # Errors
    ///
    /// Returns `TableAlreadyExists` for `ErrorIfExists` on an existing table,
    /// `SchemaMismatch` for incompatible data, `Validation` for inconsistent
    /// options, and storage or commit errors.
    pub async fn execute(self) -> Result<(Table, WriteMetrics)> {
        let span = table_span("write", self.table.uri());
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(self) -> Result<(Table, WriteMetrics)> {
        let start = Instant::now();
        let Self {
            table,
            mut input,
            mode,
            partition_by,
            schema_mode,
            name,
            description,
            configuration,
            target_file_size,
        } = self;

        if schema_mode == Some(SchemaMode::Overwrite) && mode != SaveMode::Overwrite {
            return Err(TableError::validation(
                "schema mode overwrite requires save mode Overwrite",
            ));
        }
        TableProperties::validate(&configuration)?;

        let current = table.latest_or_none().await?;
        if let Some(snapshot) = &current {
            match mode {
                SaveMode::ErrorIfExists => {
                    return Err(TableError::TableAlreadyExists {
                        location: table.uri().to_string(),
                    });
                }
                SaveMode::Ignore => {
                    let metrics = WriteMetrics {
                        version: snapshot.version(),
                        num_files: 0,
                        num_rows: 0,
                        num_removed_files: 0,
                    };
                    return Ok((table.with_snapshot(current), metrics));
                }
                SaveMode::Append | SaveMode::Overwrite => {}
            }
        }

        let first = input.try_next().await?;
        let incoming = first
            .as_ref()
            .map(|batch| Schema::try_from_arrow(&batch.schema()))
            .transpose()?;
        let request = LayoutRequest {
            creates_table: current.is_none(),
            partition_by,
            schema_mode,
            name,
            description,
            configuration,
        };
        let layout = request.resolve(current.as_deref(), incoming.as_ref())?;

        let mut writer = PartitionedWriter::new(
            table.storage().clone(),
            layout.schema.clone(),
            layout.partition_columns.clone(),
            target_file_size.unwrap_or(table.config().target_file_size),
        )?;
        let written = write_input(&mut writer, first, input, &layout.schema).await;
        let num_rows = match written {
            Ok(rows) => rows,
            Err(e) => {
                writer.discard().await;
                return Err(e);
            }
        };
        let adds = writer.close().await?;

        let mut planner = WritePlanner {
            request,
            incoming,
            layout,
            mode,
            adds,
            location: table.uri().to_string(),
            num_rows,
        };
        let committed = match Committer::new(table.log(), table.config())
            .run(current, &mut planner)
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                let paths: Vec<String> = planner.adds.iter().map(|a| a.path.clone()).collect();
                discard(&table, &paths).await;
                return Err(e);
            }
        };
        if !committed.committed {
            let paths: Vec<String> = planner.adds.iter().map(|a| a.path.clone()).collect();
            discard(&table, &paths).await;
        }

        let mut metrics = committed.output;
        if let Some(snapshot) = &committed.snapshot {
            metrics.version = snapshot.version();
        }
        metrics::record_operation_duration("write", start.elapsed());
        info!(
            metric = "tidal_write",
            version = metrics.version,
            files = metrics.num_files,
            rows = metrics.num_rows,
            elapsed_ms = elapsed_ms(start),
            "write finished"
        );
        Ok((table.with_snapshot(committed.snapshot), metrics))
    }
}

async fn write_input(
    writer: &mut PartitionedWriter,
    first: Option<RecordBatch>,
    mut rest: BoxStream<'static, Result<RecordBatch>>,
    schema: &Schema,
) -> Result<u64> {
    let mut rows = 0;
    let mut next = first;
    while let Some(batch) = next {
        let incoming = Schema::try_from_arrow(&batch.schema())?;
        check_compatible(schema, &incoming)?;
        rows += batch.num_rows() as u64;
        writer.write_batch(&batch).await?;
        next = rest.try_next().await?;
    }
    Ok(rows)
}

async fn discard(table: &Table, paths: &[String]) {
    for path in paths {
        if let Err(e) = table.storage().delete(path).await {
            warn!(path = %path, error = %e, "failed to delete uncommitted data file");
        }
    }
}

/// Checks that every incoming column exists in `table` with the same type
/// and that no required table column is missing.
fn check_compatible(table: &Schema, incoming: &Schema) -> Result<()> {
    for field in incoming.fields() {
        match table.field(&field.name) {
            None => {
                return Err(TableError::schema_mismatch(format!(
                    "column `{}` is not in the table schema; write with schema mode merge to add it",
                    field.name
                )));
            }
            Some(existing) if existing.data_type != field.data_type => {
                return Err(TableError::schema_mismatch(format!(
                    "column `{}` is {} in the table but {} in the data",
                    field.name, existing.data_type, field.data_type
                )));
            }
            Some(_) => {}
        }
    }
    if let Some(missing) = table
        .fields()
        .iter()
        .find(|f| !f.nullable && incoming.field(&f.name).is_none())
    {
        return Err(TableError::schema_mismatch(format!(
            "required column `{}` is missing from the data",
            missing.name
        )));
    }
    Ok(())
}

/// Schema and partitioning chosen for the write.
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    schema: Schema,
    partition_columns: Vec<String>,
    /// Metadata to commit, when it changes.
    metadata: Option<Metadata>,
}

#[derive(Debug, Clone)]
struct LayoutRequest {
    /// Set when no table existed at planning time.
    creates_table: bool,
    partition_by: Option<Vec<String>>,
    schema_mode: Option<SchemaMode>,
    name: Option<String>,
    description: Option<String>,
    configuration: BTreeMap<String, String>,
}

impl LayoutRequest {
    fn resolve(&self, current: Option<&Snapshot>, incoming: Option<&Schema>) -> Result<Layout> {
        let Some(snapshot) = current else {
            let schema = incoming
                .cloned()
                .ok_or_else(|| TableError::validation("cannot create a table from empty input"))?;
            let partition_columns = self.partition_by.clone().unwrap_or_default();
            schema.validate_partition_columns(&partition_columns)?;
            let metadata = Metadata {
                id: Uuid::now_v7().to_string(),
                name: self.name.clone(),
                description: self.description.clone(),
                schema: schema.clone(),
                partition_columns: partition_columns.clone(),
                configuration: self.configuration.clone(),
                created_time: Utc::now().timestamp_millis(),
            };
            return Ok(Layout {
                schema,
                partition_columns,
                metadata: Some(metadata),
            });
        };

        let existing = snapshot.metadata();
        if let Some(partition_by) = &self.partition_by {
            if partition_by != &existing.partition_columns {
                return Err(TableError::validation(format!(
                    "partition columns {partition_by:?} do not match the table's {:?}",
                    existing.partition_columns
                )));
            }
        }
        let partition_columns = existing.partition_columns.clone();

        let schema = match (self.schema_mode, incoming) {
            (_, None) => existing.schema.clone(),
            (None, Some(incoming)) => {
                check_compatible(&existing.schema, incoming)?;
                existing.schema.clone()
            }
            (Some(SchemaMode::Merge), Some(incoming)) => existing.schema.merge(incoming)?,
            (Some(SchemaMode::Overwrite), Some(incoming)) => {
                for column in &partition_columns {
                    let old = existing.schema.field(column);
                    let new = incoming.field(column);
                    if new.map(|f| f.data_type) != old.map(|f| f.data_type) {
                        return Err(TableError::schema_mismatch(format!(
                            "partition column `{column}` cannot be dropped or retyped by a schema overwrite"
                        )));
                    }
                }
                incoming.validate_partition_columns(&partition_columns)?;
                incoming.clone()
            }
        };

        let metadata = (schema != existing.schema).then(|| Metadata {
            schema: schema.clone(),
            ..existing.clone()
        });
        Ok(Layout {
            schema,
            partition_columns,
            metadata,
        })
    }
}

struct WritePlanner {
    request: LayoutRequest,
    incoming: Option<Schema>,
    layout: Layout,
    mode: SaveMode,
    adds: Vec<AddFile>,
    location: String,
    num_rows: u64,
}

#[async_trait]
impl CommitPlanner for WritePlanner {
    type Output = WriteMetrics;

    async fn plan(&mut self, snapshot: Option<&Arc<Snapshot>>) -> Result<Planned<WriteMetrics>> {
        let layout = match snapshot {
            None => self.layout.clone(),
            Some(current) => {
                // a concurrent writer may have created the table first
                if self.layout.metadata.as_ref().is_some_and(|m| m.id != current.metadata().id)
                    && self.request.creates_table
                {
                    match self.mode {
                        SaveMode::ErrorIfExists => {
                            return Err(TableError::TableAlreadyExists {
                                location: self.location.clone(),
                            });
                        }
                        SaveMode::Ignore => {
                            return Ok(Planned::Noop(WriteMetrics {
                                version: current.version(),
                                num_files: 0,
                                num_rows: 0,
                                num_removed_files: 0,
                            }));
                        }
                        SaveMode::Append | SaveMode::Overwrite => {}
                    }
                }
                let relaid = self.request.resolve(Some(current), self.incoming.as_ref())?;
                if relaid.schema != self.layout.schema
                    || relaid.partition_columns != self.layout.partition_columns
                {
                    return Err(TableError::schema_mismatch(
                        "the table schema changed concurrently with this write",
                    ));
                }
                relaid
            }
        };

        if let (Some(current), None, true, SaveMode::Append) =
            (snapshot, &layout.metadata, self.adds.is_empty(), self.mode)
        {
            return Ok(Planned::Noop(WriteMetrics {
                version: current.version(),
                num_files: 0,
                num_rows: 0,
                num_removed_files: 0,
            }));
        }

        let mut prepared = PreparedCommit::new(Operation::Write {
            mode: self.mode,
            partition_by: layout.partition_columns.clone(),
            schema_mode: self.request.schema_mode,
        });
        if let Some(metadata) = layout.metadata {
            prepared.actions.push(Action::MetaData(metadata));
        }
        let mut removed = 0;
        if let (SaveMode::Overwrite, Some(current)) = (self.mode, snapshot) {
            let now = Utc::now().timestamp_millis();
            for file in current.files() {
                prepared.actions.push(Action::Remove(file.remove(now, true)));
                removed += 1;
            }
        }
        prepared
            .actions
            .extend(self.adds.iter().cloned().map(Action::Add));
        prepared.metrics = BTreeMap::from([
            ("numFiles".to_string(), self.adds.len().into()),
            ("numOutputRows".to_string(), self.num_rows.into()),
            ("numRemovedFiles".to_string(), removed.into()),
        ]);

        let metrics = WriteMetrics {
            version: snapshot.map_or(0, |s| s.version() + 1),
            num_files: self.adds.len(),
            num_rows: self.num_rows,
            num_removed_files: removed,
        };
        Ok(Planned::Commit(prepared, metrics))
    }
}
