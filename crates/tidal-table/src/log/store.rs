//! Transaction log storage.
//!
//! Entries live at `_tidal_log/{version:020}.json` and are only ever created
//! with a create-if-absent write, so each version has exactly one winner.
//! Checkpoints live next to them as `{version:020}.checkpoint.json`. The head
//! is discovered by listing; there is no mutable pointer object.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tidal_core::TableStorage;
use tracing::{debug, warn};

use super::actions::{decode_entry, encode_entry, Action};
use super::checkpoint::Checkpoint;
use crate::error::{Result, TableError};

/// Directory holding the log, relative to the table root.
pub const LOG_DIR: &str = "_tidal_log";

const ENTRY_SUFFIX: &str = ".json";
const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";

/// Path of the entry for `version`.
#[must_use]
pub fn entry_path(version: u64) -> String {
    format!("{LOG_DIR}/{version:020}{ENTRY_SUFFIX}")
}

/// Path of the checkpoint for `version`.
#[must_use]
pub fn checkpoint_path(version: u64) -> String {
    format!("{LOG_DIR}/{version:020}{CHECKPOINT_SUFFIX}")
}

/// A file recognized inside the log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFile {
    /// A commit entry.
    Entry(u64),
    /// A checkpoint.
    Checkpoint(u64),
}

impl LogFile {
    /// Parses a table-relative path. Unrelated files yield `None`.
    #[must_use]
    pub fn parse(path: &str) -> Option<Self> {
        let name = path.strip_prefix(LOG_DIR)?.strip_prefix('/')?;
        if let Some(stem) = name.strip_suffix(CHECKPOINT_SUFFIX) {
            return parse_version(stem).map(Self::Checkpoint);
        }
        name.strip_suffix(ENTRY_SUFFIX)
            .and_then(parse_version)
            .map(Self::Entry)
    }
}

fn parse_version(stem: &str) -> Option<u64> {
    if stem.len() == 20 && stem.bytes().all(|b| b.is_ascii_digit()) {
        stem.parse().ok()
    } else {
        None
    }
}

/// Versions present in the log at listing time.
#[derive(Debug, Clone, Default)]
pub struct LogListing {
    /// Entry versions with their last-modified times.
    pub entries: BTreeMap<u64, Option<DateTime<Utc>>>,
    /// Checkpoint versions with their last-modified times.
    pub checkpoints: BTreeMap<u64, Option<DateTime<Utc>>>,
}

impl LogListing {
    /// Latest committed version.
    #[must_use]
    pub fn head(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    /// Whether no entry exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First version whose state can be rebuilt from what is retained.
    ///
    /// That is version 0 if the whole log is present, otherwise the oldest
    /// checkpoint from which every later entry up to the head is present.
    #[must_use]
    pub fn earliest_reconstructible(&self) -> Option<u64> {
        let head = self.head()?;
        let mut start = head;
        while start > 0 && self.entries.contains_key(&(start - 1)) {
            start -= 1;
        }
        if start == 0 {
            return Some(0);
        }
        // entries `start..=head` are contiguous; a checkpoint at `start - 1`
        // or later bridges the gap.
        self.checkpoints
            .keys()
            .copied()
            .find(|c| *c + 1 >= start && *c <= head)
    }

    /// Newest checkpoint at or before `version` from which `version` can be
    /// replayed.
    #[must_use]
    pub fn checkpoint_for(&self, version: u64) -> Option<u64> {
        self.checkpoints
            .range(..=version)
            .rev()
            .map(|(c, _)| *c)
            .find(|c| (*c + 1..=version).all(|v| self.entries.contains_key(&v)))
    }
}

/// Reads and appends log files for one table.
#[derive(Debug, Clone)]
pub struct LogStore {
    storage: TableStorage,
}

impl LogStore {
    /// Creates a log store over the table's storage.
    #[must_use]
    pub fn new(storage: TableStorage) -> Self {
        Self { storage }
    }

    /// Returns the table storage.
    #[must_use]
    pub fn storage(&self) -> &TableStorage {
        &self.storage
    }

    /// Lists entries and checkpoints.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn listing(&self) -> Result<LogListing> {
        let mut listing = LogListing::default();
        for meta in self.storage.list(&format!("{LOG_DIR}/")).await? {
            match LogFile::parse(&meta.path) {
                Some(LogFile::Entry(v)) => {
                    listing.entries.insert(v, meta.last_modified);
                }
                Some(LogFile::Checkpoint(v)) => {
                    listing.checkpoints.insert(v, meta.last_modified);
                }
                None => {}
            }
        }
        Ok(listing)
    }

    /// Reads the actions of one entry.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotFound` if the entry is gone, or a decoding error.
    pub async fn read_entry(&self, version: u64) -> Result<Vec<Action>> {
        match self.storage.get(&entry_path(version)).await {
            Ok(bytes) => decode_entry(&bytes),
            Err(e) if e.is_not_found() => Err(TableError::version_not_found(format!(
                "log entry for version {version} does not exist"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the entry for `version` if no other writer has.
    ///
    /// Returns `false` when the version is already taken.
    ///
    /// # Errors
    ///
    /// Propagates storage and encoding errors.
    pub async fn write_entry(&self, version: u64, actions: &[Action]) -> Result<bool> {
        let payload = encode_entry(actions)?;
        Ok(self
            .storage
            .create_if_absent(&entry_path(version), payload)
            .await?)
    }

    /// Reads a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotFound` if it is gone, or a decoding error.
    pub async fn read_checkpoint(&self, version: u64) -> Result<Checkpoint> {
        match self.storage.get(&checkpoint_path(version)).await {
            Ok(bytes) => Checkpoint::decode(&bytes),
            Err(e) if e.is_not_found() => Err(TableError::version_not_found(format!(
                "checkpoint for version {version} does not exist"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a checkpoint, replacing any existing one for the version.
    ///
    /// # Errors
    ///
    /// Propagates storage and encoding errors.
    pub async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.storage
            .put(
                &checkpoint_path(checkpoint.version),
                checkpoint.encode()?,
                tidal_core::WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    /// Deletes entries and checkpoints older than `checkpoint_version` whose
    /// files were last modified before `cutoff`.
    ///
    /// Entries are deleted oldest first so an interrupted cleanup still
    /// leaves a contiguous suffix. Returns the number of files deleted.
    ///
    /// # Errors
    ///
    /// Propagates storage errors from listing; individual delete failures
    /// stop the cleanup.
    pub async fn cleanup_expired(&self, checkpoint_version: u64, cutoff: DateTime<Utc>) -> Result<usize> {
        let listing = self.listing().await?;
        let expired = |modified: &Option<DateTime<Utc>>| modified.is_some_and(|m| m <= cutoff);

        let mut deleted = 0;
        let mut entries = BTreeSet::new();
        for (version, modified) in listing.entries.range(..checkpoint_version) {
            if !expired(modified) {
                // keep the remaining log contiguous
                break;
            }
            entries.insert(*version);
        }
        for version in &entries {
            self.storage.delete(&entry_path(*version)).await?;
            deleted += 1;
        }
        for (version, modified) in listing.checkpoints.range(..checkpoint_version) {
            if expired(modified) {
                self.storage.delete(&checkpoint_path(*version)).await?;
                deleted += 1;
            } else {
                warn!(version, "keeping unexpired checkpoint");
            }
        }
        debug!(checkpoint_version, deleted, "expired log cleanup finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tidal_core::MemoryBackend;

    use super::*;

    fn log() -> LogStore {
        LogStore::new(TableStorage::new(
            Arc::new(MemoryBackend::new()),
            "t",
            "memory://bucket/t",
        ))
    }

    #[test]
    fn test_log_paths_parse_back() {
        assert_eq!(entry_path(7), "_tidal_log/00000000000000000007.json");
        assert_eq!(LogFile::parse(&entry_path(7)), Some(LogFile::Entry(7)));
        assert_eq!(
            LogFile::parse(&checkpoint_path(10)),
            Some(LogFile::Checkpoint(10))
        );
        assert_eq!(LogFile::parse("_tidal_log/7.json"), None);
        assert_eq!(LogFile::parse("part-1.parquet"), None);
    }

    #[test]
    fn test_earliest_reconstructible() {
        let mut listing = LogListing::default();
        assert_eq!(listing.earliest_reconstructible(), None);
        for v in 0..=12 {
            listing.entries.insert(v, None);
        }
        assert_eq!(listing.earliest_reconstructible(), Some(0));

        listing.checkpoints.insert(10, None);
        for v in 0..10 {
            listing.entries.remove(&v);
        }
        assert_eq!(listing.earliest_reconstructible(), Some(10));
        assert_eq!(listing.checkpoint_for(12), Some(10));
        assert_eq!(listing.checkpoint_for(9), None);
    }

    #[tokio::test]
    async fn test_entry_is_create_if_absent() {
        let log = log();
        assert!(log.write_entry(0, &[]).await.unwrap());
        assert!(!log.write_entry(0, &[]).await.unwrap());
        assert_eq!(log.listing().await.unwrap().head(), Some(0));
    }

    #[tokio::test]
    async fn test_missing_entry_is_version_not_found() {
        let err = log().read_entry(3).await.unwrap_err();
        assert!(matches!(err, TableError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_checkpoint_and_newer() {
        let log = log();
        for v in 0..=4 {
            assert!(log.write_entry(v, &[]).await.unwrap());
        }
        let deleted = log.cleanup_expired(3, Utc::now()).await.unwrap();
        assert_eq!(deleted, 3);
        let listing = log.listing().await.unwrap();
        assert_eq!(listing.entries.keys().copied().collect::<Vec<_>>(), vec![3, 4]);
    }
}
