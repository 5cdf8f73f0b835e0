//! MERGE: upsert, delete and insert driven by a join predicate.
//!
//! The builder collects clauses as text. [`MergeBuilder::execute`] parses
//! and checks everything before touching storage, then hands a planner to
//! the committer. Each commit attempt binds the clauses to the current
//! target schema, rescans the source and rewrites only the files whose rows
//! changed.
//!
//! ```rust,no_run
//! # use tidal_table::prelude::*;
//! # async fn run(table: Table, source: MemorySource) -> tidal_table::Result<()> {
//! let (table, metrics) = table
//!     .merge(source, "target.id = source.id")
//!     .when_matched_update(|u| u.update("value", "source.value"))
//!     .when_not_matched_insert(|i| i.set("id", "source.id").set("value", "source.value"))
//!     .execute()
//!     .await?;
//! println!("v{:?}: {} updated", table.version(), metrics.num_target_rows_updated);
//! # Ok(())
//! # }
//! ```

mod executor;
mod join;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tidal_core::observability::table_span;
use tracing::{info, Instrument};

use crate::commit::{elapsed_ms, ClauseSummary, Committer, Operation};
use crate::error::{Result, TableError};
use crate::expr::{bind, parse_expression, parse_predicate, BindScope, BoundColumn, Expr, Side};
use crate::metrics;
use crate::schema::Schema;
use crate::table::Table;

use executor::MergePlanner;

/// Rows to merge into a table. Scanned once per commit attempt.
#[async_trait]
pub trait MergeSource: Send + Sync + fmt::Debug {
    /// Schema of the scanned batches.
    fn schema(&self) -> SchemaRef;

    /// Starts a fresh scan.
    async fn scan(&self) -> Result<BoxStream<'static, Result<RecordBatch>>>;
}

/// A source backed by batches held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl MemorySource {
    /// Creates a source from batches sharing one schema.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `batches` is empty or the schemas differ.
    pub fn try_new(batches: Vec<RecordBatch>) -> Result<Self> {
        let schema = batches
            .first()
            .map(RecordBatch::schema)
            .ok_or_else(|| TableError::validation("merge source needs at least one batch"))?;
        Self::with_schema(schema, batches)
    }

    /// Creates a source with an explicit schema; `batches` may be empty.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a batch has a different schema.
    pub fn with_schema(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        if let Some(other) = batches.iter().find(|b| b.schema().fields() != schema.fields()) {
            return Err(TableError::validation(format!(
                "merge source batches disagree on schema: {schema:?} vs {:?}",
                other.schema()
            )));
        }
        Ok(Self { schema, batches })
    }
}

#[async_trait]
impl MergeSource for MemorySource {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    async fn scan(&self) -> Result<BoxStream<'static, Result<RecordBatch>>> {
        let batches: Vec<_> = self.batches.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(batches).boxed())
    }
}

type StreamFactory = dyn Fn() -> BoxStream<'static, Result<RecordBatch>> + Send + Sync;

/// A source that opens a new stream for every scan.
pub struct StreamSource {
    schema: SchemaRef,
    factory: Box<StreamFactory>,
}

impl StreamSource {
    /// Creates a source from a stream factory.
    pub fn new(
        schema: SchemaRef,
        factory: impl Fn() -> BoxStream<'static, Result<RecordBatch>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            schema,
            factory: Box::new(factory),
        }
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MergeSource for StreamSource {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    async fn scan(&self) -> Result<BoxStream<'static, Result<RecordBatch>>> {
        Ok((self.factory)())
    }
}

/// Counts reported by a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeMetrics {
    /// Source rows inserted.
    pub num_target_rows_inserted: u64,
    /// Target rows updated.
    pub num_target_rows_updated: u64,
    /// Target rows deleted.
    pub num_target_rows_deleted: u64,
    /// Unchanged rows rewritten from touched files.
    pub num_target_rows_copied: u64,
    /// Data files added.
    pub num_target_files_added: u64,
    /// Data files removed.
    pub num_target_files_removed: u64,
    /// Rows written in total.
    pub num_output_rows: u64,
    /// Wall time of the merge.
    pub execution_time_ms: u64,
}

/// Clause for matched or not-matched-by-source rows that rewrites columns.
#[derive(Debug, Clone, Default)]
pub struct UpdateBuilder {
    predicate: Option<String>,
    set: Vec<(String, String)>,
}

impl UpdateBuilder {
    /// Only apply to rows satisfying `predicate`.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Sets `column` to the value of `expression`.
    #[must_use]
    pub fn update(mut self, column: impl Into<String>, expression: impl Into<String>) -> Self {
        self.set.push((column.into(), expression.into()));
        self
    }
}

/// Clause that deletes matched or not-matched-by-source rows.
#[derive(Debug, Clone, Default)]
pub struct DeleteBuilder {
    predicate: Option<String>,
}

impl DeleteBuilder {
    /// Only apply to rows satisfying `predicate`.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }
}

/// Clause that inserts source rows without a match.
#[derive(Debug, Clone, Default)]
pub struct InsertBuilder {
    predicate: Option<String>,
    set: Vec<(String, String)>,
}

impl InsertBuilder {
    /// Only apply to rows satisfying `predicate`.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Sets `column` of the new row to the value of `expression`.
    #[must_use]
    pub fn set(mut self, column: impl Into<String>, expression: impl Into<String>) -> Self {
        self.set.push((column.into(), expression.into()));
        self
    }
}

/// Clause lists given all at once. Within the matched and by-source lists
/// updates are ordered before deletes.
#[derive(Debug, Clone, Default)]
pub struct MergeClauses {
    /// `WHEN MATCHED THEN UPDATE` clauses.
    pub matched_update: Vec<UpdateBuilder>,
    /// `WHEN MATCHED THEN DELETE` clauses.
    pub matched_delete: Vec<DeleteBuilder>,
    /// `WHEN NOT MATCHED THEN INSERT` clauses.
    pub not_matched_insert: Vec<InsertBuilder>,
    /// `WHEN NOT MATCHED BY SOURCE THEN UPDATE` clauses.
    pub not_matched_by_source_update: Vec<UpdateBuilder>,
    /// `WHEN NOT MATCHED BY SOURCE THEN DELETE` clauses.
    pub not_matched_by_source_delete: Vec<DeleteBuilder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseKind {
    Update,
    Delete,
    Insert,
    UpdateAll,
    InsertAll,
}

impl ClauseKind {
    fn action_type(self) -> &'static str {
        match self {
            Self::Update | Self::UpdateAll => "update",
            Self::Delete => "delete",
            Self::Insert | Self::InsertAll => "insert",
        }
    }
}

#[derive(Debug, Clone)]
struct ClauseSpec {
    kind: ClauseKind,
    predicate: Option<String>,
    set: Vec<(String, String)>,
}

impl ClauseSpec {
    fn summary(&self) -> ClauseSummary {
        ClauseSummary {
            action_type: self.kind.action_type(),
            predicate: self.predicate.clone(),
        }
    }
}

impl From<UpdateBuilder> for ClauseSpec {
    fn from(b: UpdateBuilder) -> Self {
        Self {
            kind: ClauseKind::Update,
            predicate: b.predicate,
            set: b.set,
        }
    }
}

impl From<DeleteBuilder> for ClauseSpec {
    fn from(b: DeleteBuilder) -> Self {
        Self {
            kind: ClauseKind::Delete,
            predicate: b.predicate,
            set: Vec::new(),
        }
    }
}

impl From<InsertBuilder> for ClauseSpec {
    fn from(b: InsertBuilder) -> Self {
        Self {
            kind: ClauseKind::Insert,
            predicate: b.predicate,
            set: b.set,
        }
    }
}

/// Merges a source into a table.
///
/// Clause methods consume and return the builder; [`Self::execute`]
/// consumes it.
#[derive(Debug)]
pub struct MergeBuilder {
    table: Table,
    source: Arc<dyn MergeSource>,
    predicate: String,
    source_alias: String,
    target_alias: String,
    matched: Vec<ClauseSpec>,
    not_matched: Vec<ClauseSpec>,
    not_matched_by_source: Vec<ClauseSpec>,
    target_file_size: Option<u64>,
}

impl MergeBuilder {
    pub(crate) fn new(table: Table, source: Arc<dyn MergeSource>, predicate: impl Into<String>) -> Self {
        Self {
            table,
            source,
            predicate: predicate.into(),
            source_alias: "source".into(),
            target_alias: "target".into(),
            matched: Vec::new(),
            not_matched: Vec::new(),
            not_matched_by_source: Vec::new(),
            target_file_size: None,
        }
    }

    /// Alias for source columns; defaults to `source`.
    #[must_use]
    pub fn with_source_alias(mut self, alias: impl Into<String>) -> Self {
        self.source_alias = alias.into();
        self
    }

    /// Alias for target columns; defaults to `target`.
    #[must_use]
    pub fn with_target_alias(mut self, alias: impl Into<String>) -> Self {
        self.target_alias = alias.into();
        self
    }

    /// Overrides the engine's target file size for rewritten files.
    #[must_use]
    pub fn with_target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = Some(bytes);
        self
    }

    /// Updates matched target rows.
    #[must_use]
    pub fn when_matched_update(mut self, build: impl FnOnce(UpdateBuilder) -> UpdateBuilder) -> Self {
        self.matched.push(build(UpdateBuilder::default()).into());
        self
    }

    /// Deletes matched target rows.
    #[must_use]
    pub fn when_matched_delete(mut self, build: impl FnOnce(DeleteBuilder) -> DeleteBuilder) -> Self {
        self.matched.push(build(DeleteBuilder::default()).into());
        self
    }

    /// Inserts source rows without a match.
    #[must_use]
    pub fn when_not_matched_insert(mut self, build: impl FnOnce(InsertBuilder) -> InsertBuilder) -> Self {
        self.not_matched.push(build(InsertBuilder::default()).into());
        self
    }

    /// Updates target rows no source row matched.
    #[must_use]
    pub fn when_not_matched_by_source_update(
        mut self,
        build: impl FnOnce(UpdateBuilder) -> UpdateBuilder,
    ) -> Self {
        self.not_matched_by_source.push(build(UpdateBuilder::default()).into());
        self
    }

    /// Deletes target rows no source row matched.
    #[must_use]
    pub fn when_not_matched_by_source_delete(
        mut self,
        build: impl FnOnce(DeleteBuilder) -> DeleteBuilder,
    ) -> Self {
        self.not_matched_by_source.push(build(DeleteBuilder::default()).into());
        self
    }

    /// Updates every column of matched rows from the source.
    ///
    /// Accepted here; [`Self::execute`] rejects it with
    /// `UnsupportedClauseVariant`.
    #[must_use]
    pub fn when_matched_update_all(mut self) -> Self {
        self.matched.push(ClauseSpec {
            kind: ClauseKind::UpdateAll,
            predicate: None,
            set: Vec::new(),
        });
        self
    }

    /// Inserts every source column.
    ///
    /// Accepted here; [`Self::execute`] rejects it with
    /// `UnsupportedClauseVariant`.
    #[must_use]
    pub fn when_not_matched_insert_all(mut self) -> Self {
        self.not_matched.push(ClauseSpec {
            kind: ClauseKind::InsertAll,
            predicate: None,
            set: Vec::new(),
        });
        self
    }

    /// Appends clause lists given all at once.
    #[must_use]
    pub fn with_clauses(mut self, clauses: MergeClauses) -> Self {
        self.matched.extend(clauses.matched_update.into_iter().map(ClauseSpec::from));
        self.matched.extend(clauses.matched_delete.into_iter().map(ClauseSpec::from));
        self.not_matched
            .extend(clauses.not_matched_insert.into_iter().map(ClauseSpec::from));
        self.not_matched_by_source.extend(
            clauses
                .not_matched_by_source_update
                .into_iter()
                .map(ClauseSpec::from),
        );
        self.not_matched_by_source.extend(
            clauses
                .not_matched_by_source_delete
                .into_iter()
                .map(ClauseSpec::from),
        );
        self
    }

    /// Runs the merge and commits the result.
    ///
    /// # Errors
    ///
    /// Before any storage access: `NoClausesSpecified`,
    /// `UnsupportedClauseVariant`, `InvalidPredicate` and `Validation`.
    /// Afterwards: `TableNotFound`, `SchemaMismatch`,
    /// `MultipleSourceRowsMatched`, `ConcurrentModificationExceeded` and
    /// storage errors.
    pub async fn execute(self) -> Result<(Table, MergeMetrics)> {
        let span = table_span("merge", self.table.uri());
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(self) -> Result<(Table, MergeMetrics)> {
        let start = Instant::now();
        let plan = self.parse()?;
        let operation = self.operation();
        let Self {
            table,
            source,
            target_file_size,
            ..
        } = self;

        let snapshot = table
            .latest_or_none()
            .await?
            .ok_or_else(|| TableError::TableNotFound {
                location: table.uri().to_string(),
            })?;

        let mut planner = MergePlanner {
            storage: table.storage().clone(),
            config: table.config().clone(),
            source,
            plan,
            operation,
            target_file_size: target_file_size.unwrap_or(table.config().target_file_size),
            start,
        };
        let committed = Committer::new(table.log(), table.config())
            .run(Some(snapshot), &mut planner)
            .await?;

        let mut metrics = committed.output;
        metrics.execution_time_ms = elapsed_ms(start);
        metrics::record_merge_rows(
            metrics.num_target_rows_inserted,
            metrics.num_target_rows_updated,
            metrics.num_target_rows_deleted,
            metrics.num_target_rows_copied,
        );
        metrics::record_operation_duration("merge", start.elapsed());
        info!(
            metric = "tidal_merge",
            committed = committed.committed,
            inserted = metrics.num_target_rows_inserted,
            updated = metrics.num_target_rows_updated,
            deleted = metrics.num_target_rows_deleted,
            copied = metrics.num_target_rows_copied,
            files_added = metrics.num_target_files_added,
            files_removed = metrics.num_target_files_removed,
            elapsed_ms = metrics.execution_time_ms,
            "merge finished"
        );
        Ok((table.with_snapshot(committed.snapshot), metrics))
    }

    fn operation(&self) -> Operation {
        let summarize = |clauses: &[ClauseSpec]| clauses.iter().map(ClauseSpec::summary).collect();
        Operation::Merge {
            predicate: self.predicate.clone(),
            matched: summarize(&self.matched),
            not_matched: summarize(&self.not_matched),
            not_matched_by_source: summarize(&self.not_matched_by_source),
        }
    }

    /// Checks and parses everything that does not need storage.
    fn parse(&self) -> Result<ParsedMerge> {
        if self.matched.is_empty() && self.not_matched.is_empty() && self.not_matched_by_source.is_empty() {
            return Err(TableError::NoClausesSpecified);
        }
        let all = self
            .matched
            .iter()
            .chain(&self.not_matched)
            .chain(&self.not_matched_by_source);
        for clause in all {
            match clause.kind {
                ClauseKind::UpdateAll => {
                    return Err(TableError::UnsupportedClauseVariant {
                        clause: "when_matched_update_all",
                    });
                }
                ClauseKind::InsertAll => {
                    return Err(TableError::UnsupportedClauseVariant {
                        clause: "when_not_matched_insert_all",
                    });
                }
                _ => {}
            }
        }

        let source_alias = self.source_alias.trim();
        let target_alias = self.target_alias.trim();
        if source_alias.is_empty() || target_alias.is_empty() {
            return Err(TableError::validation("merge aliases must not be empty"));
        }
        if source_alias.eq_ignore_ascii_case(target_alias) {
            return Err(TableError::validation(format!(
                "source and target aliases must differ, both are `{source_alias}`"
            )));
        }

        Ok(ParsedMerge {
            source_alias: source_alias.to_string(),
            target_alias: target_alias.to_string(),
            predicate: Parsed::predicate(&self.predicate)?,
            matched: parse_clauses(&self.matched, target_alias)?,
            not_matched: parse_clauses(&self.not_matched, target_alias)?,
            not_matched_by_source: parse_clauses(&self.not_matched_by_source, target_alias)?,
        })
    }
}

/// An expression with the text it came from.
#[derive(Debug, Clone)]
struct Parsed {
    sql: String,
    expr: Expr,
}

impl Parsed {
    fn predicate(sql: &str) -> Result<Self> {
        Ok(Self {
            sql: sql.to_string(),
            expr: parse_predicate(sql)?,
        })
    }

    fn expression(sql: &str) -> Result<Self> {
        Ok(Self {
            sql: sql.to_string(),
            expr: parse_expression(sql)?,
        })
    }

    fn bind(&self, scope: &BindScope<'_>, aliases: (&str, &str)) -> Result<Expr<BoundColumn>> {
        bind(self.expr.clone(), scope, aliases, &self.sql)
    }
}

#[derive(Debug, Clone)]
struct ParsedClause {
    kind: ClauseKind,
    predicate: Option<Parsed>,
    /// Target column name and value.
    set: Vec<(String, Parsed)>,
}

fn parse_clauses(clauses: &[ClauseSpec], target_alias: &str) -> Result<Vec<ParsedClause>> {
    clauses
        .iter()
        .map(|clause| {
            let predicate = clause.predicate.as_deref().map(Parsed::predicate).transpose()?;
            let mut seen = HashSet::new();
            let set = clause
                .set
                .iter()
                .map(|(column, sql)| {
                    let column = strip_alias(column.trim(), target_alias);
                    if !seen.insert(column.to_ascii_lowercase()) {
                        return Err(TableError::validation(format!(
                            "column `{column}` is assigned more than once in one clause"
                        )));
                    }
                    Ok((column.to_string(), Parsed::expression(sql)?))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ParsedClause {
                kind: clause.kind,
                predicate,
                set,
            })
        })
        .collect()
}

/// `target.col` and `col` both name a target column in assignments.
fn strip_alias<'a>(column: &'a str, target_alias: &str) -> &'a str {
    match column.split_once('.') {
        Some((qualifier, name)) if qualifier.eq_ignore_ascii_case(target_alias) => name,
        _ => column,
    }
}

/// The merge request after parsing, reusable across commit attempts.
#[derive(Debug, Clone)]
struct ParsedMerge {
    source_alias: String,
    target_alias: String,
    predicate: Parsed,
    matched: Vec<ParsedClause>,
    not_matched: Vec<ParsedClause>,
    not_matched_by_source: Vec<ParsedClause>,
}

/// What a clause does to its row once its predicate holds.
#[derive(Debug, Clone)]
enum ClauseAction {
    Update(Vec<(usize, Expr<BoundColumn>)>),
    Delete,
    Insert(Vec<(usize, Expr<BoundColumn>)>),
}

#[derive(Debug, Clone)]
struct BoundClause {
    predicate: Option<Expr<BoundColumn>>,
    action: ClauseAction,
}

/// Clauses bound to the schemas of one attempt.
#[derive(Debug, Clone)]
struct BoundMerge {
    join: Expr<BoundColumn>,
    matched: Vec<BoundClause>,
    not_matched: Vec<BoundClause>,
    not_matched_by_source: Vec<BoundClause>,
}

impl ParsedMerge {
    fn bind(
        &self,
        target: &Schema,
        source: &Schema,
        partition_columns: &[String],
    ) -> Result<BoundMerge> {
        let aliases = (self.target_alias.as_str(), self.source_alias.as_str());
        let both = BindScope::both((aliases.0, target), (aliases.1, source));
        let bind_all = |clauses: &[ParsedClause], scope: BindScope<'_>| {
            clauses
                .iter()
                .map(|clause| bind_clause(clause, &scope, aliases, target, partition_columns))
                .collect::<Result<Vec<_>>>()
        };
        Ok(BoundMerge {
            join: self.predicate.bind(&both, aliases)?,
            matched: bind_all(&self.matched, both)?,
            not_matched: bind_all(&self.not_matched, both.only(Side::Source))?,
            not_matched_by_source: bind_all(&self.not_matched_by_source, both.only(Side::Target))?,
        })
    }
}

fn bind_clause(
    clause: &ParsedClause,
    scope: &BindScope<'_>,
    aliases: (&str, &str),
    target: &Schema,
    partition_columns: &[String],
) -> Result<BoundClause> {
    let predicate = clause
        .predicate
        .as_ref()
        .map(|p| p.bind(scope, aliases))
        .transpose()?;
    let set = clause
        .set
        .iter()
        .map(|(column, value)| {
            let index = target_column(target, column)?;
            let name = &target.fields()[index].name;
            // rows never move between partitions
            if clause.kind == ClauseKind::Update && partition_columns.contains(name) {
                return Err(TableError::schema_mismatch(format!(
                    "update clause assigns partition column `{name}`"
                )));
            }
            Ok((index, value.bind(scope, aliases)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let action = match clause.kind {
        ClauseKind::Update => ClauseAction::Update(set),
        ClauseKind::Delete => ClauseAction::Delete,
        ClauseKind::Insert => {
            let assigned: HashSet<usize> = set.iter().map(|(i, _)| *i).collect();
            if let Some(field) = target
                .fields()
                .iter()
                .enumerate()
                .find(|(i, f)| !f.nullable && !assigned.contains(i))
                .map(|(_, f)| f)
            {
                return Err(TableError::schema_mismatch(format!(
                    "insert clause leaves non-nullable column `{}` unset",
                    field.name
                )));
            }
            ClauseAction::Insert(set)
        }
        ClauseKind::UpdateAll | ClauseKind::InsertAll => {
            return Err(TableError::UnsupportedClauseVariant {
                clause: if clause.kind == ClauseKind::UpdateAll {
                    "when_matched_update_all"
                } else {
                    "when_not_matched_insert_all"
                },
            });
        }
    };
    Ok(BoundClause { predicate, action })
}

fn target_column(target: &Schema, column: &str) -> Result<usize> {
    if let Some(index) = target.index_of(column) {
        return Ok(index);
    }
    let mut matches = target
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| f.name.eq_ignore_ascii_case(column));
    match (matches.next(), matches.next()) {
        (Some((index, _)), None) => Ok(index),
        _ => Err(TableError::schema_mismatch(format!(
            "assignment to unknown target column `{column}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType as ArrowType, Field, Schema as ArrowSchema};
    use tidal_core::{MemoryBackend, TableStorage};

    use super::*;
    use crate::schema::{DataType, StructField};
    use crate::table::TableBuilder;

    fn table() -> Table {
        let storage = TableStorage::new(Arc::new(MemoryBackend::new()), "t", "memory://wh/t");
        TableBuilder::from_storage(storage).build().unwrap()
    }

    fn source() -> MemorySource {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new("x", ArrowType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2]))]).unwrap();
        MemorySource::try_new(vec![batch]).unwrap()
    }

    #[test]
    fn test_parse_requires_a_clause() {
        let builder = table().merge(source(), "target.x = source.x");
        assert!(matches!(builder.parse(), Err(TableError::NoClausesSpecified)));
    }

    #[test]
    fn test_update_all_is_rejected_at_parse() {
        let builder = table()
            .merge(source(), "target.x = source.x")
            .when_matched_update_all();
        assert!(matches!(
            builder.parse(),
            Err(TableError::UnsupportedClauseVariant { clause: "when_matched_update_all" })
        ));
    }

    #[test]
    fn test_aliases_must_differ() {
        let builder = table()
            .merge(source(), "a.x = a.x")
            .with_source_alias("a")
            .with_target_alias("A")
            .when_matched_delete(|d| d);
        assert!(matches!(builder.parse(), Err(TableError::Validation { .. })));

        let builder = table()
            .merge(source(), "x = 1")
            .with_source_alias(" ")
            .when_matched_delete(|d| d);
        assert!(matches!(builder.parse(), Err(TableError::Validation { .. })));
    }

    #[test]
    fn test_bad_expressions_fail_parse() {
        let builder = table()
            .merge(source(), "target.x = ")
            .when_matched_delete(|d| d);
        assert!(matches!(builder.parse(), Err(TableError::InvalidPredicate { .. })));

        let builder = table()
            .merge(source(), "target.x = source.x")
            .when_matched_update(|u| u.update("x", "source.x +"));
        assert!(matches!(builder.parse(), Err(TableError::InvalidPredicate { .. })));
    }

    #[test]
    fn test_duplicate_assignment_is_rejected() {
        let builder = table()
            .merge(source(), "target.x = source.x")
            .when_matched_update(|u| u.update("x", "1").update("target.x", "2"));
        assert!(matches!(builder.parse(), Err(TableError::Validation { .. })));
    }

    #[test]
    fn test_bind_checks_target_columns() {
        let target = Schema::new(vec![
            StructField::new("x", DataType::Long, false),
            StructField::new("y", DataType::Long, true),
        ])
        .unwrap();
        let source = Schema::new(vec![StructField::new("x", DataType::Long, false)]).unwrap();

        let unknown = table()
            .merge(self::source(), "target.x = source.x")
            .when_matched_update(|u| u.update("zz", "source.x"))
            .parse()
            .unwrap();
        assert!(matches!(
            unknown.bind(&target, &source, &[]),
            Err(TableError::SchemaMismatch { .. })
        ));

        let missing_required = table()
            .merge(self::source(), "target.x = source.x")
            .when_not_matched_insert(|i| i.set("y", "source.x"))
            .parse()
            .unwrap();
        assert!(matches!(
            missing_required.bind(&target, &source, &[]),
            Err(TableError::SchemaMismatch { .. })
        ));

        let insert_reads_target = table()
            .merge(self::source(), "target.x = source.x")
            .when_not_matched_insert(|i| i.set("x", "target.x"))
            .parse()
            .unwrap();
        assert!(matches!(
            insert_reads_target.bind(&target, &source, &[]),
            Err(TableError::InvalidPredicate { .. })
        ));
    }

    #[test]
    fn test_updates_cannot_assign_partition_columns() {
        let target = Schema::new(vec![
            StructField::new("x", DataType::Long, false),
            StructField::new("y", DataType::Long, true),
        ])
        .unwrap();
        let source = Schema::new(vec![StructField::new("x", DataType::Long, false)]).unwrap();
        let partitions = ["y".to_string()];

        let update = table()
            .merge(self::source(), "target.x = source.x")
            .when_matched_update(|u| u.update("target.y", "source.x"))
            .parse()
            .unwrap();
        assert!(matches!(
            update.bind(&target, &source, &partitions),
            Err(TableError::SchemaMismatch { .. })
        ));
        assert!(update.bind(&target, &source, &[]).is_ok());

        let insert = table()
            .merge(self::source(), "target.x = source.x")
            .when_not_matched_insert(|i| i.set("x", "source.x").set("y", "source.x"))
            .parse()
            .unwrap();
        assert!(insert.bind(&target, &source, &partitions).is_ok());
    }

    #[test]
    fn test_with_clauses_orders_updates_first() {
        let builder = table().merge(source(), "target.x = source.x").with_clauses(MergeClauses {
            matched_update: vec![UpdateBuilder::default().update("x", "source.x")],
            matched_delete: vec![DeleteBuilder::default().predicate("source.x > 1")],
            ..MergeClauses::default()
        });
        let kinds: Vec<_> = builder.matched.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ClauseKind::Update, ClauseKind::Delete]);
        let Operation::Merge { matched, .. } = builder.operation() else {
            panic!("expected a merge operation");
        };
        assert_eq!(matched[1].predicate.as_deref(), Some("source.x > 1"));
    }
}
