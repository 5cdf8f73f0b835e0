//! Snapshots: the table state at one version.
//!
//! A snapshot is built from the newest usable checkpoint at or before the
//! requested version, then the remaining entries are applied in order.
//! Snapshots never change once built; callers share them behind `Arc`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Result, TableError};
use crate::log::{Action, AddFile, Checkpoint, LogListing, LogStore, Metadata, RemoveFile};
use crate::properties::TableProperties;
use crate::schema::Schema;

/// Which version of a table to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// The newest committed version.
    #[default]
    Latest,
    /// An exact version.
    Version(u64),
    /// The newest version committed at or before the instant.
    Timestamp(DateTime<Utc>),
}

/// Table state at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    version: u64,
    timestamp: i64,
    metadata: Metadata,
    files: BTreeMap<String, AddFile>,
    tombstones: BTreeMap<String, RemoveFile>,
}

#[derive(Default)]
struct Replay {
    metadata: Option<Metadata>,
    timestamp: Option<i64>,
    files: BTreeMap<String, AddFile>,
    tombstones: BTreeMap<String, RemoveFile>,
}

impl Replay {
    fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            metadata: Some(snapshot.metadata.clone()),
            timestamp: Some(snapshot.timestamp),
            files: snapshot.files.clone(),
            tombstones: snapshot.tombstones.clone(),
        }
    }

    fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            metadata: Some(checkpoint.metadata),
            timestamp: Some(checkpoint.timestamp),
            files: checkpoint
                .files
                .into_iter()
                .map(|f| (f.path.clone(), f))
                .collect(),
            tombstones: checkpoint
                .tombstones
                .into_iter()
                .map(|t| (t.path.clone(), t))
                .collect(),
        }
    }

    fn apply(&mut self, version: u64, actions: impl IntoIterator<Item = Action>) {
        for action in actions {
            match action {
                Action::Add(mut add) => {
                    add.added_version.get_or_insert(version);
                    self.tombstones.remove(&add.path);
                    self.files.insert(add.path.clone(), add);
                }
                Action::Remove(remove) => {
                    self.files.remove(&remove.path);
                    self.tombstones.insert(remove.path.clone(), remove);
                }
                Action::MetaData(metadata) => self.metadata = Some(metadata),
                Action::CommitInfo(info) => self.timestamp = Some(info.timestamp),
            }
        }
    }

    fn finish(self, version: u64) -> Result<Snapshot> {
        let metadata = self.metadata.ok_or_else(|| {
            TableError::validation(format!("no table metadata in the log up to version {version}"))
        })?;
        Ok(Snapshot {
            version,
            timestamp: self.timestamp.unwrap_or(metadata.created_time),
            metadata,
            files: self.files,
            tombstones: self.tombstones,
        })
    }
}

impl Snapshot {
    /// Loads the snapshot selected by `selector`.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` when there is no log, `VersionNotFound` when
    /// the selector falls outside the reconstructible range.
    pub async fn load(log: &LogStore, selector: VersionSelector) -> Result<Self> {
        let listing = log.listing().await?;
        let Some(head) = listing.head() else {
            return Err(TableError::TableNotFound {
                location: log.storage().uri().to_string(),
            });
        };
        let earliest = listing.earliest_reconstructible().ok_or_else(|| {
            TableError::version_not_found(format!(
                "log is missing entries and has no usable checkpoint (head {head})"
            ))
        })?;

        let version = match selector {
            VersionSelector::Latest => head,
            VersionSelector::Version(v) if v < earliest || v > head => {
                return Err(TableError::version_not_found(format!(
                    "version {v} is outside the retained range {earliest}..={head}"
                )));
            }
            VersionSelector::Version(v) => v,
            VersionSelector::Timestamp(at) => {
                resolve_timestamp(log, &listing, earliest, head, at).await?
            }
        };
        Self::replay(log, &listing, version).await
    }

    async fn replay(log: &LogStore, listing: &LogListing, version: u64) -> Result<Self> {
        let (mut replay, start) = match listing.checkpoint_for(version) {
            Some(c) => (Replay::from_checkpoint(log.read_checkpoint(c).await?), c + 1),
            None => (Replay::default(), 0),
        };
        debug!(version, from = start, "replaying log");
        for v in start..=version {
            replay.apply(v, log.read_entry(v).await?);
        }
        replay.finish(version)
    }

    /// Returns the newest snapshot, applying only entries committed since
    /// this one.
    ///
    /// # Errors
    ///
    /// Propagates log read errors.
    pub async fn refresh(&self, log: &LogStore) -> Result<Self> {
        let listing = log.listing().await?;
        let Some(head) = listing.head() else {
            return Err(TableError::TableNotFound {
                location: log.storage().uri().to_string(),
            });
        };
        if head == self.version {
            return Ok(self.clone());
        }
        if head < self.version
            || !(self.version + 1..=head).all(|v| listing.entries.contains_key(&v))
        {
            return Self::replay(log, &listing, head).await;
        }
        let mut replay = Replay::from_snapshot(self);
        for v in self.version + 1..=head {
            replay.apply(v, log.read_entry(v).await?);
        }
        replay.finish(head)
    }

    /// Builds the snapshot that results from committing `actions` on top of
    /// this one as `version`.
    pub(crate) fn with_actions(&self, version: u64, actions: &[Action]) -> Result<Self> {
        let mut replay = Replay::from_snapshot(self);
        replay.apply(version, actions.iter().cloned());
        replay.finish(version)
    }

    /// Builds the first snapshot of a table from its version-0 actions.
    pub(crate) fn initial(actions: &[Action]) -> Result<Self> {
        let mut replay = Replay::default();
        replay.apply(0, actions.iter().cloned());
        replay.finish(0)
    }

    /// Captures this state as a checkpoint, dropping tombstones deleted
    /// before `tombstone_cutoff_ms`.
    #[must_use]
    pub fn to_checkpoint(&self, tombstone_cutoff_ms: i64) -> Checkpoint {
        Checkpoint {
            version: self.version,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            files: self.files.values().cloned().collect(),
            tombstones: self
                .tombstones
                .values()
                .filter(|t| t.deletion_timestamp >= tombstone_cutoff_ms)
                .cloned()
                .collect(),
        }
    }

    /// Version of this snapshot.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Commit timestamp (ms since epoch).
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Table metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Table schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.metadata.schema
    }

    /// Partition columns.
    #[must_use]
    pub fn partition_columns(&self) -> &[String] {
        &self.metadata.partition_columns
    }

    /// Parsed table properties.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed property values.
    pub fn properties(&self) -> Result<TableProperties> {
        TableProperties::from_configuration(&self.metadata.configuration)
    }

    /// Active files, ordered by path.
    pub fn files(&self) -> impl Iterator<Item = &AddFile> {
        self.files.values()
    }

    /// Looks up an active file.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&AddFile> {
        self.files.get(path)
    }

    /// Number of active files.
    #[must_use]
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Removed files retained for vacuum.
    pub fn tombstones(&self) -> impl Iterator<Item = &RemoveFile> {
        self.tombstones.values()
    }
}

async fn resolve_timestamp(
    log: &LogStore,
    listing: &LogListing,
    earliest: u64,
    head: u64,
    at: DateTime<Utc>,
) -> Result<u64> {
    let target = at.timestamp_millis();
    let first = commit_timestamp(log, listing, earliest).await?;
    if first > target {
        return Err(TableError::version_not_found(format!(
            "{at} is before the earliest retained version {earliest}, committed at {}",
            DateTime::<Utc>::from_timestamp_millis(first).map_or_else(|| first.to_string(), |t| t.to_string())
        )));
    }

    // commit timestamps increase with version; find the last one <= target
    let (mut lo, mut hi) = (earliest, head);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if commit_timestamp(log, listing, mid).await? <= target {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

async fn commit_timestamp(log: &LogStore, listing: &LogListing, version: u64) -> Result<i64> {
    match log.read_entry(version).await {
        Ok(actions) => actions
            .into_iter()
            .find_map(|a| match a {
                Action::CommitInfo(info) => Some(info.timestamp),
                _ => None,
            })
            .or_else(|| {
                listing
                    .entries
                    .get(&version)
                    .copied()
                    .flatten()
                    .map(|t| t.timestamp_millis())
            })
            .ok_or_else(|| {
                TableError::validation(format!("version {version} has no commit timestamp"))
            }),
        Err(TableError::VersionNotFound { .. }) if listing.checkpoints.contains_key(&version) => {
            Ok(log.read_checkpoint(version).await?.timestamp)
        }
        Err(e) => Err(e),
    }
}
