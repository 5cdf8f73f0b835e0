//! One merge attempt: read touched candidates, classify rows, rewrite files.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tidal_core::{EngineConfig, TableStorage};
use tracing::debug;

use super::join::{JoinPlan, TargetIndex};
use super::{BoundClause, BoundMerge, ClauseAction, MergeMetrics, MergeSource, ParsedMerge};
use crate::commit::{elapsed_ms, CommitPlanner, Operation, Planned, PreparedCommit};
use crate::data_files::{read_rows, PartitionedWriter};
use crate::error::{Result, TableError};
use crate::expr::{BoundColumn, ColumnSource, Expr, MergeRow};
use crate::log::{Action, AddFile};
use crate::schema::Schema;
use crate::snapshot::Snapshot;
use crate::value::{batch_to_rows, Row, Value};

pub(super) struct MergePlanner {
    pub storage: TableStorage,
    pub config: EngineConfig,
    pub source: Arc<dyn MergeSource>,
    pub plan: ParsedMerge,
    pub operation: Operation,
    pub target_file_size: u64,
    pub start: Instant,
}

/// Fate of one target row.
#[derive(Debug, Clone, Default)]
enum Outcome {
    #[default]
    Unchanged,
    Updated(Row),
    Deleted,
}

#[derive(Debug, Clone, Default)]
struct RowState {
    matches: u32,
    outcome: Outcome,
}

impl RowState {
    fn is_modified(&self) -> bool {
        !matches!(self.outcome, Outcome::Unchanged)
    }
}

/// Target rows of the candidate files and what happened to them.
struct TargetRows {
    files: Vec<AddFile>,
    rows: Vec<Vec<Row>>,
    states: Vec<Vec<RowState>>,
}

#[derive(Debug, Default)]
struct Counts {
    inserted: u64,
    updated: u64,
    deleted: u64,
    copied: u64,
}

#[async_trait]
impl CommitPlanner for MergePlanner {
    type Output = MergeMetrics;

    async fn plan(&mut self, snapshot: Option<&Arc<Snapshot>>) -> Result<Planned<MergeMetrics>> {
        let snapshot = snapshot.ok_or_else(|| TableError::TableNotFound {
            location: self.storage.uri().to_string(),
        })?;
        let target_schema = snapshot.schema();
        let source_schema = Schema::try_from_arrow(&self.source.schema())?;
        let BoundMerge {
            join,
            matched,
            not_matched,
            not_matched_by_source,
        } = self
            .plan
            .bind(target_schema, &source_schema, snapshot.partition_columns())?;
        let join = JoinPlan::new(join, target_schema, &source_schema);

        let mut target = self
            .read_candidates(snapshot, &join, not_matched_by_source.is_empty())
            .await?;
        let index = TargetIndex::build(&join, &target.rows);
        debug!(
            files = target.files.len(),
            hash_keys = join.target_keys.len(),
            "target rows indexed"
        );

        let mut writer = PartitionedWriter::new(
            self.storage.clone(),
            target_schema.clone(),
            snapshot.partition_columns().to_vec(),
            self.target_file_size,
        )?;
        let mut counts = Counts::default();
        let rewritten = async {
            self.insert_from_source(
                &mut writer,
                &source_schema,
                &join,
                &index,
                &matched,
                &not_matched,
                &mut target,
                &mut counts,
            )
            .await?;
            apply_by_source(&not_matched_by_source, &mut target, &mut counts)?;

            let touched: Vec<usize> = (0..target.files.len())
                .filter(|&f| target.states[f].iter().any(RowState::is_modified))
                .collect();
            let mut num_output_rows = counts.inserted;
            for &f in &touched {
                let rows = std::mem::take(&mut target.rows[f]);
                let mut output = Vec::with_capacity(rows.len());
                for (row, state) in rows.into_iter().zip(std::mem::take(&mut target.states[f])) {
                    match state.outcome {
                        Outcome::Unchanged => {
                            counts.copied += 1;
                            output.push(row);
                        }
                        Outcome::Updated(updated) => output.push(updated),
                        Outcome::Deleted => {}
                    }
                }
                num_output_rows += output.len() as u64;
                writer.write_rows(output).await?;
            }
            writer.flush_open().await?;
            Ok::<_, TableError>((touched, num_output_rows))
        }
        .await;
        let (touched, num_output_rows) = match rewritten {
            Ok(done) => done,
            Err(e) => {
                writer.discard().await;
                return Err(e);
            }
        };

        if touched.is_empty() && counts.inserted == 0 {
            debug!("merge changed no rows");
            return Ok(Planned::Noop(MergeMetrics {
                execution_time_ms: elapsed_ms(self.start),
                ..MergeMetrics::default()
            }));
        }

        let adds = writer.close().await?;
        let now = Utc::now().timestamp_millis();
        let mut prepared = PreparedCommit::new(self.operation.clone());
        for &f in &touched {
            prepared.actions.push(Action::Remove(target.files[f].remove(now, true)));
        }
        prepared.attempt_files = adds.iter().map(|a| a.path.clone()).collect();

        let metrics = MergeMetrics {
            num_target_rows_inserted: counts.inserted,
            num_target_rows_updated: counts.updated,
            num_target_rows_deleted: counts.deleted,
            num_target_rows_copied: counts.copied,
            num_target_files_added: adds.len() as u64,
            num_target_files_removed: touched.len() as u64,
            num_output_rows,
            execution_time_ms: elapsed_ms(self.start),
        };
        prepared.actions.extend(adds.into_iter().map(Action::Add));
        prepared.metrics = operation_metrics(&metrics);
        Ok(Planned::Commit(prepared, metrics))
    }
}

impl MergePlanner {
    /// Reads the files that may hold matching rows. Without by-source
    /// clauses, files excluded by partition literals of the join predicate
    /// cannot change and are skipped.
    async fn read_candidates(
        &self,
        snapshot: &Arc<Snapshot>,
        join: &JoinPlan,
        prune: bool,
    ) -> Result<TargetRows> {
        let schema = snapshot.schema();
        let partition_columns = snapshot.partition_columns();
        let files: Vec<AddFile> = snapshot
            .files()
            .filter(|f| !prune || join.may_match(f, schema, partition_columns))
            .cloned()
            .collect();
        if prune && files.len() < snapshot.num_files() {
            debug!(
                skipped = snapshot.num_files() - files.len(),
                "files pruned by partition predicate"
            );
        }

        let rows: Vec<Vec<Row>> = futures::stream::iter(files.iter().cloned())
            .map(|file| {
                let storage = self.storage.clone();
                let snapshot = Arc::clone(snapshot);
                async move {
                    read_rows(&storage, &file, snapshot.schema(), snapshot.partition_columns())
                        .await
                }
            })
            .buffered(self.config.max_concurrent_reads.max(1))
            .try_collect()
            .await?;
        let states = rows.iter().map(|r| vec![RowState::default(); r.len()]).collect();
        Ok(TargetRows {
            files,
            rows,
            states,
        })
    }

    /// Streams the source through the matched and not-matched clauses.
    /// Inserted rows go to `writer` chunk by chunk, so files roll at the
    /// target size while the source is still being read.
    #[allow(clippy::too_many_arguments)]
    async fn insert_from_source(
        &self,
        writer: &mut PartitionedWriter,
        source_schema: &Schema,
        join: &JoinPlan,
        index: &TargetIndex,
        matched: &[BoundClause],
        not_matched: &[BoundClause],
        target: &mut TargetRows,
        counts: &mut Counts,
    ) -> Result<()> {
        let width = writer.schema().fields().len();
        let mut scan = self.source.scan().await?;
        let chunk = self.config.source_batch_size.max(1);
        while let Some(batch) = scan.try_next().await? {
            let mut offset = 0;
            while offset < batch.num_rows() {
                let len = chunk.min(batch.num_rows() - offset);
                let rows = batch_to_rows(&batch.slice(offset, len), source_schema)?;
                offset += len;
                let mut inserts = Vec::new();
                for source_row in &rows {
                    let found = match_source_row(
                        source_row,
                        index,
                        join.residual.as_ref(),
                        matched,
                        target,
                        counts,
                    )?;
                    if !found {
                        if let Some(row) = insert_row(source_row, not_matched, width)? {
                            inserts.push(row);
                        }
                    }
                }
                if !inserts.is_empty() {
                    counts.inserted += inserts.len() as u64;
                    writer.write_rows(inserts).await?;
                }
            }
        }
        Ok(())
    }
}

/// Runs the matched clauses for every target row `source` joins with.
/// Returns whether any target row matched.
fn match_source_row(
    source: &[Value],
    index: &TargetIndex,
    residual: Option<&Expr<BoundColumn>>,
    clauses: &[BoundClause],
    target: &mut TargetRows,
    counts: &mut Counts,
) -> Result<bool> {
    let mut found = false;
    for &(f, r) in index.candidates(source) {
        let row = MergeRow::pair(&target.rows[f][r], source);
        if let Some(residual) = residual {
            if !residual.evaluate_predicate(&row)? {
                continue;
            }
        }
        found = true;

        let state = &mut target.states[f][r];
        state.matches += 1;
        let fired = first_firing(clauses, &row)?;
        if state.matches > 1 && (state.is_modified() || fired.is_some()) {
            return Err(TableError::MultipleSourceRowsMatched {
                path: target.files[f].path.clone(),
            });
        }
        if let Some(clause) = fired {
            state.outcome = apply(&clause.action, &target.rows[f][r], &row)?;
            count(&state.outcome, counts);
        }
    }
    Ok(found)
}

fn insert_row(source: &[Value], clauses: &[BoundClause], width: usize) -> Result<Option<Row>> {
    let row = MergeRow::source_only(source);
    let Some(clause) = first_firing(clauses, &row)? else {
        return Ok(None);
    };
    let ClauseAction::Insert(set) = &clause.action else {
        return Ok(None);
    };
    let mut out = vec![Value::Null; width];
    for (index, expr) in set {
        out[*index] = expr.evaluate(&row)?;
    }
    Ok(Some(out))
}

fn apply_by_source(
    clauses: &[BoundClause],
    target: &mut TargetRows,
    counts: &mut Counts,
) -> Result<()> {
    if clauses.is_empty() {
        return Ok(());
    }
    for (rows, states) in target.rows.iter().zip(target.states.iter_mut()) {
        for (original, state) in rows.iter().zip(states.iter_mut()) {
            if state.matches > 0 {
                continue;
            }
            let row = MergeRow::target_only(original);
            if let Some(clause) = first_firing(clauses, &row)? {
                state.outcome = apply(&clause.action, original, &row)?;
                count(&state.outcome, counts);
            }
        }
    }
    Ok(())
}

/// First clause, in declaration order, whose predicate holds.
fn first_firing<'c>(clauses: &'c [BoundClause], row: &dyn ColumnSource) -> Result<Option<&'c BoundClause>> {
    for clause in clauses {
        let fires = match &clause.predicate {
            Some(predicate) => predicate.evaluate_predicate(row)?,
            None => true,
        };
        if fires {
            return Ok(Some(clause));
        }
    }
    Ok(None)
}

fn apply(action: &ClauseAction, original: &[Value], row: &dyn ColumnSource) -> Result<Outcome> {
    match action {
        ClauseAction::Update(set) => {
            let mut updated = original.to_vec();
            for (index, expr) in set {
                updated[*index] = expr.evaluate(row)?;
            }
            Ok(Outcome::Updated(updated))
        }
        ClauseAction::Delete => Ok(Outcome::Deleted),
        ClauseAction::Insert(_) => Err(TableError::validation(
            "insert clauses only apply to source rows without a match",
        )),
    }
}

fn count(outcome: &Outcome, counts: &mut Counts) {
    match outcome {
        Outcome::Updated(_) => counts.updated += 1,
        Outcome::Deleted => counts.deleted += 1,
        Outcome::Unchanged => {}
    }
}

fn operation_metrics(metrics: &MergeMetrics) -> BTreeMap<String, serde_json::Value> {
    match serde_json::to_value(metrics) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}
