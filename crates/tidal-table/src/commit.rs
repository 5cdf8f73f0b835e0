//! Optimistic commit protocol.
//!
//! Each attempt plans against the newest snapshot and tries to create the log
//! entry for `read_version + 1`. Losing the create-if-absent race means some
//! other writer took the version: files written by the losing plan are deleted
//! best-effort, the snapshot is refreshed, and planning runs again. After a
//! successful commit on a checkpoint boundary the committer writes a
//! checkpoint and, if enabled, deletes expired log files.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tidal_core::EngineConfig;
use tracing::{debug, info, warn};

use crate::error::{Result, TableError};
use crate::log::{Action, CommitInfo, LogStore, ENGINE_INFO};
use crate::metrics;
use crate::operations::write::{SaveMode, SchemaMode};
use crate::snapshot::Snapshot;

/// A merge clause as recorded in commit parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClauseSummary {
    /// `update`, `delete` or `insert`.
    pub action_type: &'static str,
    /// Clause predicate text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

/// Operations that produce commits.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Table creation without data.
    Create {
        /// Save mode the create ran with.
        mode: SaveMode,
        /// Table location.
        location: String,
        /// Partition columns.
        partition_by: Vec<String>,
    },
    /// Append or overwrite of data.
    Write {
        /// Save mode.
        mode: SaveMode,
        /// Partition columns.
        partition_by: Vec<String>,
        /// Schema evolution mode, if any.
        schema_mode: Option<SchemaMode>,
    },
    /// Merge of a source into the table.
    Merge {
        /// Join predicate text.
        predicate: String,
        /// Matched clauses in declaration order.
        matched: Vec<ClauseSummary>,
        /// Not-matched clauses in declaration order.
        not_matched: Vec<ClauseSummary>,
        /// Not-matched-by-source clauses in declaration order.
        not_matched_by_source: Vec<ClauseSummary>,
    },
    /// Compaction of small files.
    Optimize {
        /// Target file size in bytes.
        target_size: u64,
        /// `column=value` partition filters.
        partition_filters: Vec<String>,
    },
}

impl Operation {
    /// Name written to [`CommitInfo::operation`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "CREATE TABLE",
            Self::Write { .. } => "WRITE",
            Self::Merge { .. } => "MERGE",
            Self::Optimize { .. } => "OPTIMIZE",
        }
    }

    /// Short label for metrics and spans.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Write { .. } => "write",
            Self::Merge { .. } => "merge",
            Self::Optimize { .. } => "optimize",
        }
    }

    /// Whether the commit changes the table's rows.
    #[must_use]
    pub fn data_change(&self) -> bool {
        !matches!(self, Self::Optimize { .. })
    }

    /// Parameters written to [`CommitInfo::operation_parameters`].
    #[must_use]
    pub fn parameters(&self) -> BTreeMap<String, serde_json::Value> {
        let mut params = BTreeMap::new();
        let mut put = |key: &str, value: serde_json::Value| {
            params.insert(key.to_string(), value);
        };
        match self {
            Self::Create {
                mode,
                location,
                partition_by,
            } => {
                put("mode", mode.as_str().into());
                put("location", location.as_str().into());
                put("partitionBy", json(partition_by));
            }
            Self::Write {
                mode,
                partition_by,
                schema_mode,
            } => {
                put("mode", mode.as_str().into());
                put("partitionBy", json(partition_by));
                if let Some(schema_mode) = schema_mode {
                    put("schemaMode", schema_mode.as_str().into());
                }
            }
            Self::Merge {
                predicate,
                matched,
                not_matched,
                not_matched_by_source,
            } => {
                put("predicate", predicate.as_str().into());
                put("matchedPredicates", json(matched));
                put("notMatchedPredicates", json(not_matched));
                put("notMatchedBySourcePredicates", json(not_matched_by_source));
            }
            Self::Optimize {
                target_size,
                partition_filters,
            } => {
                put("targetSize", (*target_size).into());
                put("predicate", json(partition_filters));
            }
        }
        params
    }
}

fn json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// File actions and provenance for one commit attempt.
#[derive(Debug, Clone)]
pub struct PreparedCommit {
    /// The operation being committed.
    pub operation: Operation,
    /// `add`, `remove` and `metaData` actions. Commit info is added by the
    /// committer.
    pub actions: Vec<Action>,
    /// Operation metrics recorded in commit info.
    pub metrics: BTreeMap<String, serde_json::Value>,
    /// Data files written only for this attempt; deleted if it loses.
    pub attempt_files: Vec<String>,
}

impl PreparedCommit {
    /// Starts a commit with no actions.
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            actions: Vec::new(),
            metrics: BTreeMap::new(),
            attempt_files: Vec::new(),
        }
    }
}

/// Outcome of planning one attempt.
#[derive(Debug)]
pub enum Planned<T> {
    /// Commit these actions and return `T` on success.
    Commit(PreparedCommit, T),
    /// Nothing to commit; return `T` as is.
    Noop(T),
}

/// Re-runnable planning step of an operation.
#[async_trait]
pub trait CommitPlanner: Send {
    /// Value produced by a successful operation.
    type Output: Send;

    /// Plans against `snapshot` (`None` if the table does not exist yet).
    ///
    /// Called once per attempt with the refreshed snapshot.
    async fn plan(&mut self, snapshot: Option<&Arc<Snapshot>>) -> Result<Planned<Self::Output>>;
}

/// Result of running a planner to completion.
#[derive(Debug)]
pub struct Committed<T> {
    /// Snapshot after the commit, or the planning snapshot for no-ops.
    pub snapshot: Option<Arc<Snapshot>>,
    /// Whether a version was written.
    pub committed: bool,
    /// Planner output.
    pub output: T,
}

/// Runs planners against the log with bounded retries.
#[derive(Debug)]
pub struct Committer<'a> {
    log: &'a LogStore,
    config: &'a EngineConfig,
}

impl<'a> Committer<'a> {
    /// Creates a committer.
    #[must_use]
    pub fn new(log: &'a LogStore, config: &'a EngineConfig) -> Self {
        Self { log, config }
    }

    /// Plans and commits until a version is won or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns planner errors as is, `ConcurrentModificationExceeded` after
    /// `max_commit_attempts` lost races, and storage errors.
    pub async fn run<P: CommitPlanner>(
        &self,
        mut snapshot: Option<Arc<Snapshot>>,
        planner: &mut P,
    ) -> Result<Committed<P::Output>> {
        let max_attempts = self.config.max_commit_attempts.max(1);
        for attempt in 1..=max_attempts {
            let (prepared, output) = match planner.plan(snapshot.as_ref()).await? {
                Planned::Noop(output) => {
                    return Ok(Committed {
                        snapshot,
                        committed: false,
                        output,
                    });
                }
                Planned::Commit(prepared, output) => (prepared, output),
            };
            let label = prepared.operation.label();
            metrics::record_commit_attempt(label);

            if let Err(e) = validate_actions(snapshot.as_deref(), &prepared.actions) {
                self.discard(&prepared.attempt_files).await;
                return Err(e);
            }
            let version = snapshot.as_ref().map_or(0, |s| s.version() + 1);
            let actions = self.finalize_actions(snapshot.as_deref(), version, &prepared);

            let won = match self.log.write_entry(version, &actions).await {
                Ok(won) => won,
                Err(e) => {
                    self.discard(&prepared.attempt_files).await;
                    return Err(e);
                }
            };
            if won {
                let next = match &snapshot {
                    Some(parent) => parent.with_actions(version, &actions)?,
                    None => Snapshot::initial(&actions)?,
                };
                info!(
                    metric = "tidal_commit",
                    operation = prepared.operation.name(),
                    version,
                    attempt,
                    "committed"
                );
                let next = Arc::new(next);
                self.after_commit(&next).await;
                return Ok(Committed {
                    snapshot: Some(next),
                    committed: true,
                    output,
                });
            }

            metrics::record_commit_conflict(label);
            warn!(
                metric = "tidal_commit_conflict",
                operation = prepared.operation.name(),
                version,
                attempt,
                max_attempts,
                "version already committed by another writer; re-planning"
            );
            self.discard(&prepared.attempt_files).await;
            snapshot = Some(Arc::new(match &snapshot {
                Some(current) => current.refresh(self.log).await?,
                None => Snapshot::load(self.log, crate::snapshot::VersionSelector::Latest).await?,
            }));
        }

        Err(TableError::ConcurrentModificationExceeded {
            attempts: max_attempts,
        })
    }

    fn finalize_actions(
        &self,
        parent: Option<&Snapshot>,
        version: u64,
        prepared: &PreparedCommit,
    ) -> Vec<Action> {
        let now = Utc::now().timestamp_millis();
        // commit timestamps strictly increase so timestamp lookups can bisect
        let timestamp = parent.map_or(now, |p| now.max(p.timestamp() + 1));

        let mut actions = Vec::with_capacity(prepared.actions.len() + 1);
        actions.push(Action::CommitInfo(CommitInfo {
            timestamp,
            operation: prepared.operation.name().to_string(),
            operation_parameters: prepared.operation.parameters(),
            user_id: self.config.user_id.clone(),
            user_name: self.config.user_name.clone(),
            engine_info: ENGINE_INFO.to_string(),
            read_version: parent.map(Snapshot::version),
            operation_metrics: prepared.metrics.clone(),
        }));
        for action in &prepared.actions {
            let mut action = action.clone();
            if let Action::Add(add) = &mut action {
                add.added_version = Some(version);
            }
            actions.push(action);
        }
        actions
    }

    async fn discard(&self, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.log.storage().delete(path).await {
                warn!(path = %path, error = %e, "failed to delete data file of a lost commit");
            }
        }
    }

    async fn after_commit(&self, snapshot: &Snapshot) {
        let properties = match snapshot.properties() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "invalid table properties; skipping checkpoint");
                return;
            }
        };
        let version = snapshot.version();
        if version == 0 || version % properties.checkpoint_interval != 0 {
            return;
        }

        let now = Utc::now();
        let cutoff = now
            .checked_sub_signed(properties.log_retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let checkpoint = snapshot.to_checkpoint(cutoff.timestamp_millis());
        if let Err(e) = self.log.write_checkpoint(&checkpoint).await {
            warn!(version, error = %e, "checkpoint write failed");
            return;
        }
        debug!(version, files = checkpoint.files.len(), "checkpoint written");

        if properties.enable_expired_log_cleanup {
            match self.log.cleanup_expired(version, cutoff).await {
                Ok(deleted) if deleted > 0 => {
                    info!(version, deleted, "expired log files deleted");
                }
                Ok(_) => {}
                Err(e) => warn!(version, error = %e, "expired log cleanup failed"),
            }
        }
    }
}

/// Rejects action sets that would break snapshot invariants: removing an
/// inactive file, adding an already active one, or touching a path twice.
fn validate_actions(snapshot: Option<&Snapshot>, actions: &[Action]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut has_metadata = false;
    for action in actions {
        match action {
            Action::Add(add) => {
                if snapshot.is_some_and(|s| s.file(&add.path).is_some()) {
                    return Err(TableError::validation(format!(
                        "file {} is already active",
                        add.path
                    )));
                }
                if !seen.insert(add.path.as_str()) {
                    return Err(TableError::validation(format!(
                        "file {} appears twice in one commit",
                        add.path
                    )));
                }
            }
            Action::Remove(remove) => {
                if !snapshot.is_some_and(|s| s.file(&remove.path).is_some()) {
                    return Err(TableError::validation(format!(
                        "cannot remove {}: not an active file",
                        remove.path
                    )));
                }
                if !seen.insert(remove.path.as_str()) {
                    return Err(TableError::validation(format!(
                        "file {} appears twice in one commit",
                        remove.path
                    )));
                }
            }
            Action::MetaData(_) => has_metadata = true,
            Action::CommitInfo(_) => {
                return Err(TableError::validation(
                    "commit info is written by the committer",
                ));
            }
        }
    }
    if snapshot.is_none() && !has_metadata {
        return Err(TableError::validation(
            "the first commit of a table must carry metadata",
        ));
    }
    Ok(())
}

/// Milliseconds elapsed since `start`, saturating.
pub(crate) fn elapsed_ms(start: std::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
