//! Compaction: rewrites small files of a partition into fewer large ones.
//!
//! Files below the target size are bin-packed per partition; every bin of
//! two or more files becomes one rewrite task. Tasks run concurrently and
//! are committed with `dataChange = false`, either all at once or whenever
//! `min_commit_interval` has passed. Before each commit the rewrites are
//! checked against the refreshed snapshot; a rewrite whose inputs were
//! removed meanwhile is dropped and its output deleted.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tidal_core::observability::table_span;
use tidal_core::TableStorage;
use tracing::{debug, info, warn, Instrument};

use crate::commit::{elapsed_ms, CommitPlanner, Committer, Operation, Planned, PreparedCommit};
use crate::data_files::{read_rows, PartitionedWriter, NULL_PARTITION};
use crate::error::{Result, TableError};
use crate::log::{Action, AddFile, PartitionValues};
use crate::metrics;
use crate::snapshot::Snapshot;
use crate::table::Table;

/// Size distribution of a set of files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSizeStats {
    /// Smallest file, bytes.
    pub min: u64,
    /// Largest file, bytes.
    pub max: u64,
    /// Mean size, bytes.
    pub avg: f64,
    /// Number of files.
    pub total_files: u64,
    /// Sum of sizes, bytes.
    pub total_size: u64,
}

impl FileSizeStats {
    fn add(&mut self, size: u64) {
        self.min = if self.total_files == 0 { size } else { self.min.min(size) };
        self.max = self.max.max(size);
        self.total_files += 1;
        self.total_size += size;
        #[allow(clippy::cast_precision_loss)]
        {
            self.avg = self.total_size as f64 / self.total_files as f64;
        }
    }
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeMetrics {
    /// Files written.
    pub num_files_added: u64,
    /// Files removed.
    pub num_files_removed: u64,
    /// Sizes of written files.
    pub files_added: FileSizeStats,
    /// Sizes of removed files.
    pub files_removed: FileSizeStats,
    /// Partitions with at least one committed rewrite.
    pub partitions_optimized: u64,
    /// Rewrite groups committed.
    pub num_batches: u64,
    /// Files passing the partition filters.
    pub total_considered_files: u64,
    /// Considered files left as they are.
    pub total_files_skipped: u64,
    /// Whether rows kept their insertion order.
    pub preserve_insertion_order: bool,
}

/// Compacts small files.
pub struct OptimizeBuilder {
    table: Table,
    target_size: Option<u64>,
    max_concurrent_tasks: usize,
    min_commit_interval: Option<Duration>,
    partition_filters: Vec<String>,
    preserve_insertion_order: bool,
}

impl fmt::Debug for OptimizeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizeBuilder")
            .field("uri", &self.table.uri())
            .field("target_size", &self.target_size)
            .field("max_concurrent_tasks", &self.max_concurrent_tasks)
            .field("min_commit_interval", &self.min_commit_interval)
            .field("partition_filters", &self.partition_filters)
            .finish_non_exhaustive()
    }
}

impl OptimizeBuilder {
    pub(crate) fn new(table: Table) -> Self {
        Self {
            table,
            target_size: None,
            max_concurrent_tasks: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            min_commit_interval: None,
            partition_filters: Vec::new(),
            preserve_insertion_order: false,
        }
    }

    /// Size of output files and upper bound for files to compact; defaults
    /// to the engine's target file size.
    #[must_use]
    pub fn with_target_size(mut self, bytes: u64) -> Self {
        self.target_size = Some(bytes);
        self
    }

    /// Rewrite tasks run at once.
    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.max_concurrent_tasks = tasks.max(1);
        self
    }

    /// Commit finished rewrites whenever this much time has passed.
    #[must_use]
    pub fn with_min_commit_interval(mut self, interval: Duration) -> Self {
        self.min_commit_interval = Some(interval);
        self
    }

    /// Only compact partitions matching every `column=value` filter.
    #[must_use]
    pub fn with_partition_filters(mut self, filters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.partition_filters = filters.into_iter().map(Into::into).collect();
        self
    }

    /// Rewrite files in the order they were added instead of by size.
    #[must_use]
    pub fn with_preserve_insertion_order(mut self, preserve: bool) -> Self {
        self.preserve_insertion_order = preserve;
        self
    }

    /// Runs the compaction.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound`, `Validation` for malformed filters, read,
    /// write and commit errors.
    pub async fn execute(self) -> Result<(Table, OptimizeMetrics)> {
        let span = table_span("optimize", self.table.uri());
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(self) -> Result<(Table, OptimizeMetrics)> {
        let start = Instant::now();
        let snapshot = self
            .table
            .latest_or_none()
            .await?
            .ok_or_else(|| TableError::TableNotFound {
                location: self.table.uri().to_string(),
            })?;
        let filters = parse_filters(&self.partition_filters, snapshot.partition_columns())?;
        let target_size = self
            .target_size
            .unwrap_or(self.table.config().target_file_size)
            .max(1);
        let plan = plan_bins(&snapshot, &filters, target_size, self.preserve_insertion_order);
        let mut metrics = OptimizeMetrics {
            total_considered_files: plan.considered,
            preserve_insertion_order: self.preserve_insertion_order,
            ..OptimizeMetrics::default()
        };
        debug!(
            bins = plan.bins.len(),
            considered = plan.considered,
            "compaction planned"
        );

        let operation = Operation::Optimize {
            target_size,
            partition_filters: self.partition_filters.clone(),
        };
        let storage = self.table.storage().clone();
        let mut rewrites = futures::stream::iter(plan.bins)
            .map(|bin| rewrite_bin(storage.clone(), Arc::clone(&snapshot), bin, target_size))
            .buffer_unordered(self.max_concurrent_tasks);

        let mut current = Some(Arc::clone(&snapshot));
        let mut pending = Vec::new();
        let mut committed = Vec::new();
        let mut last_commit = Instant::now();
        while let Some(result) = rewrites.next().await {
            match result {
                Ok(rewrite) => pending.push(rewrite),
                Err(e) => {
                    discard_outputs(&storage, &pending).await;
                    return Err(e);
                }
            }
            if self
                .min_commit_interval
                .is_some_and(|interval| last_commit.elapsed() >= interval)
            {
                let (next, done) =
                    commit_rewrites(&self.table, current, std::mem::take(&mut pending), &operation)
                        .await?;
                current = next;
                committed.extend(done);
                last_commit = Instant::now();
            }
        }
        drop(rewrites);
        if !pending.is_empty() {
            let (next, done) = commit_rewrites(&self.table, current, pending, &operation).await?;
            current = next;
            committed.extend(done);
        }

        let mut partitions = std::collections::BTreeSet::new();
        for rewrite in &committed {
            partitions.insert(rewrite.partition.clone());
            for file in &rewrite.removed {
                metrics.files_removed.add(file.size);
            }
            for file in &rewrite.added {
                metrics.files_added.add(file.size);
            }
        }
        metrics.num_files_added = metrics.files_added.total_files;
        metrics.num_files_removed = metrics.files_removed.total_files;
        metrics.partitions_optimized = partitions.len() as u64;
        metrics.num_batches = committed.len() as u64;
        metrics.total_files_skipped = metrics.total_considered_files - metrics.num_files_removed;

        metrics::record_operation_duration("optimize", start.elapsed());
        info!(
            metric = "tidal_optimize",
            files_added = metrics.num_files_added,
            files_removed = metrics.num_files_removed,
            partitions = metrics.partitions_optimized,
            elapsed_ms = elapsed_ms(start),
            "compaction finished"
        );
        Ok((self.table.with_snapshot(current), metrics))
    }
}

/// Parses `column=value` filters; `value` may be the null partition marker.
fn parse_filters(
    filters: &[String],
    partition_columns: &[String],
) -> Result<Vec<(String, Option<String>)>> {
    filters
        .iter()
        .map(|filter| {
            let (column, value) = filter.split_once('=').ok_or_else(|| {
                TableError::validation(format!("partition filter `{filter}` is not column=value"))
            })?;
            let column = column.trim();
            if !partition_columns.iter().any(|c| c == column) {
                return Err(TableError::validation(format!(
                    "partition filter column `{column}` is not a partition column"
                )));
            }
            let value = value.trim();
            let value = (value != NULL_PARTITION).then(|| value.to_string());
            Ok((column.to_string(), value))
        })
        .collect()
}

#[derive(Debug)]
struct BinPlan {
    bins: Vec<Bin>,
    considered: u64,
}

#[derive(Debug, Clone)]
struct Bin {
    partition: PartitionValues,
    files: Vec<AddFile>,
}

fn plan_bins(
    snapshot: &Snapshot,
    filters: &[(String, Option<String>)],
    target_size: u64,
    preserve_insertion_order: bool,
) -> BinPlan {
    let mut considered = 0;
    let mut by_partition: BTreeMap<PartitionValues, Vec<AddFile>> = BTreeMap::new();
    for file in snapshot.files() {
        let selected = filters.iter().all(|(column, value)| {
            file.partition_values.get(column).cloned().flatten() == *value
        });
        if !selected {
            continue;
        }
        considered += 1;
        if file.size < target_size {
            by_partition
                .entry(file.partition_values.clone())
                .or_default()
                .push(file.clone());
        }
    }

    let mut bins = Vec::new();
    for (partition, mut files) in by_partition {
        if preserve_insertion_order {
            files.sort_by(|a, b| {
                (a.added_version, a.modification_time, &a.path)
                    .cmp(&(b.added_version, b.modification_time, &b.path))
            });
        } else {
            files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        }
        let mut current: Vec<AddFile> = Vec::new();
        let mut current_size = 0;
        for file in files {
            if !current.is_empty() && current_size + file.size > target_size {
                bins.push(Bin {
                    partition: partition.clone(),
                    files: std::mem::take(&mut current),
                });
                current_size = 0;
            }
            current_size += file.size;
            current.push(file);
        }
        if !current.is_empty() {
            bins.push(Bin {
                partition,
                files: current,
            });
        }
    }
    bins.retain(|bin| bin.files.len() >= 2);
    BinPlan { bins, considered }
}

#[derive(Debug, Clone)]
struct Rewrite {
    partition: PartitionValues,
    removed: Vec<AddFile>,
    added: Vec<AddFile>,
}

async fn rewrite_bin(
    storage: TableStorage,
    snapshot: Arc<Snapshot>,
    bin: Bin,
    target_size: u64,
) -> Result<Rewrite> {
    let mut writer = PartitionedWriter::new(
        storage.clone(),
        snapshot.schema().clone(),
        snapshot.partition_columns().to_vec(),
        target_size,
    )?
    .with_data_change(false);
    let copied = async {
        for file in &bin.files {
            let rows =
                read_rows(&storage, file, snapshot.schema(), snapshot.partition_columns()).await?;
            writer.write_rows(rows).await?;
        }
        writer.flush_open().await
    }
    .await;
    if let Err(e) = copied {
        writer.discard().await;
        return Err(e);
    }
    let added = writer.close().await?;
    debug!(
        inputs = bin.files.len(),
        outputs = added.len(),
        "partition rewritten"
    );
    Ok(Rewrite {
        partition: bin.partition,
        removed: bin.files,
        added,
    })
}

async fn discard_outputs(storage: &TableStorage, rewrites: &[Rewrite]) {
    for file in rewrites.iter().flat_map(|r| &r.added) {
        if let Err(e) = storage.delete(&file.path).await {
            warn!(path = %file.path, error = %e, "failed to delete uncommitted compaction output");
        }
    }
}

/// Commits `rewrites`, returning the new snapshot and the rewrites that
/// made it in.
async fn commit_rewrites(
    table: &Table,
    snapshot: Option<Arc<Snapshot>>,
    rewrites: Vec<Rewrite>,
    operation: &Operation,
) -> Result<(Option<Arc<Snapshot>>, Vec<Rewrite>)> {
    let mut planner = OptimizePlanner {
        operation: operation.clone(),
        pending: rewrites,
        abandoned: Vec::new(),
        location: table.uri().to_string(),
    };
    let result = Committer::new(table.log(), table.config())
        .run(snapshot, &mut planner)
        .await;
    discard_outputs(table.storage(), &planner.abandoned).await;
    let committed = match result {
        Ok(committed) => committed,
        Err(e) => {
            discard_outputs(table.storage(), &planner.pending).await;
            return Err(e);
        }
    };
    Ok((committed.snapshot, committed.output))
}

struct OptimizePlanner {
    operation: Operation,
    pending: Vec<Rewrite>,
    abandoned: Vec<Rewrite>,
    location: String,
}

#[async_trait]
impl CommitPlanner for OptimizePlanner {
    type Output = Vec<Rewrite>;

    async fn plan(&mut self, snapshot: Option<&Arc<Snapshot>>) -> Result<Planned<Vec<Rewrite>>> {
        let snapshot = snapshot.ok_or_else(|| TableError::TableNotFound {
            location: self.location.clone(),
        })?;
        let (valid, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|r| r.removed.iter().all(|f| snapshot.file(&f.path).is_some()));
        if !stale.is_empty() {
            warn!(
                dropped = stale.len(),
                "compaction inputs changed concurrently; dropping affected rewrites"
            );
        }
        self.abandoned.extend(stale);
        self.pending = valid;
        if self.pending.is_empty() {
            return Ok(Planned::Noop(Vec::new()));
        }

        let now = Utc::now().timestamp_millis();
        let mut prepared = PreparedCommit::new(self.operation.clone());
        let (mut removed, mut added) = (0_u64, 0_u64);
        for rewrite in &self.pending {
            for file in &rewrite.removed {
                prepared.actions.push(Action::Remove(file.remove(now, false)));
                removed += 1;
            }
            for file in &rewrite.added {
                prepared.actions.push(Action::Add(file.clone()));
                added += 1;
            }
        }
        prepared.metrics = BTreeMap::from([
            ("numFilesAdded".to_string(), added.into()),
            ("numFilesRemoved".to_string(), removed.into()),
            ("numBatches".to_string(), (self.pending.len() as u64).into()),
        ]);
        Ok(Planned::Commit(prepared, self.pending.clone()))
    }
}
