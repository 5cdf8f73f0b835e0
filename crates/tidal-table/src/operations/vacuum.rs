//! Vacuum: deletes data files removed from the table longer ago than the
//! retention window.
//!
//! A file is deleted only if all of these hold:
//! - it is a tombstone of the latest snapshot (removed in the log)
//! - its removal is older than `now - retention`
//! - it is not active in the latest snapshot
//! - it is not active in the snapshot that was current at the cutoff
//! - it still exists in storage
//!
//! Files never referenced by the log are left alone.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tidal_core::observability::table_span;
use tracing::{debug, info, warn, Instrument};

use crate::error::{Result, TableError};
use crate::log::LOG_DIR;
use crate::metrics;
use crate::snapshot::{Snapshot, VersionSelector};
use crate::table::Table;

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of a vacuum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VacuumMetrics {
    /// True if nothing was deleted because of a dry run.
    pub dry_run: bool,
    /// Table-relative paths deleted (or that would be deleted).
    pub files_deleted: Vec<String>,
    /// Bytes held by those files.
    pub bytes_reclaimed: u64,
}

/// Deletes expired tombstoned files.
pub struct VacuumBuilder {
    table: Table,
    retention_hours: Option<i64>,
    dry_run: bool,
    enforce_retention: bool,
    clock: Clock,
}

impl fmt::Debug for VacuumBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VacuumBuilder")
            .field("uri", &self.table.uri())
            .field("retention_hours", &self.retention_hours)
            .field("dry_run", &self.dry_run)
            .field("enforce_retention", &self.enforce_retention)
            .finish_non_exhaustive()
    }
}

impl VacuumBuilder {
    pub(crate) fn new(table: Table) -> Self {
        Self {
            table,
            retention_hours: None,
            dry_run: false,
            enforce_retention: true,
            clock: Arc::new(Utc::now),
        }
    }

    /// Retention window; defaults to `vacuum.minRetentionHours`.
    #[must_use]
    pub fn with_retention_hours(mut self, hours: i64) -> Self {
        self.retention_hours = Some(hours);
        self
    }

    /// Report candidates without deleting anything.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reject retentions below the table minimum (default). When disabled,
    /// a short retention only logs a warning.
    #[must_use]
    pub fn with_enforce_retention(mut self, enforce: bool) -> Self {
        self.enforce_retention = enforce;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the vacuum.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` without a log, `Validation` for a negative
    /// retention, `RetentionTooShort` when enforced, and storage errors.
    pub async fn execute(self) -> Result<(Table, VacuumMetrics)> {
        let span = table_span("vacuum", self.table.uri());
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(self) -> Result<(Table, VacuumMetrics)> {
        let start = Instant::now();
        let Self {
            table,
            retention_hours,
            dry_run,
            enforce_retention,
            clock,
        } = self;

        let snapshot = table
            .latest_or_none()
            .await?
            .ok_or_else(|| TableError::TableNotFound {
                location: table.uri().to_string(),
            })?;
        let minimum_hours = snapshot.properties()?.vacuum_min_retention_hours;
        let requested_hours = retention_hours.unwrap_or(minimum_hours);
        if requested_hours < 0 {
            return Err(TableError::validation(format!(
                "retention must not be negative, got {requested_hours}h"
            )));
        }
        if requested_hours < minimum_hours {
            if enforce_retention {
                return Err(TableError::RetentionTooShort {
                    requested_hours,
                    minimum_hours,
                });
            }
            warn!(
                requested_hours,
                minimum_hours,
                "vacuum retention is below the table minimum; readers of older versions may fail"
            );
        }

        let now = clock();
        let cutoff = Duration::try_hours(requested_hours)
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let candidates = expired_tombstones(&table, &snapshot, cutoff).await?;

        let stored: HashMap<String, u64> = table
            .storage()
            .list("")
            .await?
            .into_iter()
            .filter(|meta| !meta.path.starts_with(LOG_DIR))
            .map(|meta| (meta.path, meta.size))
            .collect();
        let mut deletable: Vec<(String, u64)> = candidates
            .into_iter()
            .filter_map(|path| stored.get(&path).map(|&size| (path, size)))
            .collect();
        deletable.sort();

        let bytes_reclaimed: u64 = deletable.iter().map(|(_, size)| size).sum();
        let files_deleted: Vec<String> = deletable.into_iter().map(|(path, _)| path).collect();
        if dry_run {
            info!(
                metric = "tidal_vacuum",
                dry_run,
                candidates = files_deleted.len(),
                bytes_reclaimed,
                "vacuum dry run finished"
            );
        } else {
            for path in &files_deleted {
                table.storage().delete(path).await?;
                debug!(path = %path, "vacuumed");
            }
            metrics::record_vacuum_deleted(files_deleted.len() as u64);
            info!(
                metric = "tidal_vacuum",
                dry_run,
                deleted = files_deleted.len(),
                bytes_reclaimed,
                "vacuum finished"
            );
        }
        metrics::record_operation_duration("vacuum", start.elapsed());

        let metrics = VacuumMetrics {
            dry_run,
            files_deleted,
            bytes_reclaimed,
        };
        Ok((table.with_snapshot(Some(snapshot)), metrics))
    }
}

async fn expired_tombstones(
    table: &Table,
    latest: &Snapshot,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>> {
    let cutoff_ms = cutoff.timestamp_millis();
    let mut candidates: Vec<String> = latest
        .tombstones()
        .filter(|t| t.deletion_timestamp < cutoff_ms)
        .filter(|t| latest.file(&t.path).is_none())
        .map(|t| t.path.clone())
        .collect();
    if candidates.is_empty() {
        return Ok(candidates);
    }

    // the version readers could still have open at the cutoff
    let at_cutoff = match Snapshot::load(table.log(), VersionSelector::Timestamp(cutoff)).await {
        Ok(snapshot) => Some(snapshot),
        Err(TableError::VersionNotFound { .. }) => None,
        Err(e) => return Err(e),
    };
    if let Some(at_cutoff) = at_cutoff {
        let retained: HashSet<&str> = at_cutoff.files().map(|f| f.path.as_str()).collect();
        candidates.retain(|path| !retained.contains(path.as_str()));
    }
    Ok(candidates)
}

