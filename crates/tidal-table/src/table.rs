//! Table handles.
//!
//! A [`Table`] pairs a location's storage with an optional loaded snapshot.
//! Operations consume the handle through their builders and hand back an
//! updated one, so a handle always reflects the version it last saw.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use tidal_core::{EngineConfig, StorageOptions, StorageRegistry, TableStorage};
use tracing::debug;

use crate::data_files::read_rows;
use crate::error::{Result, TableError};
use crate::log::{Action, CommitInfo, LogStore, Metadata};
use crate::operations::create::CreateBuilder;
use crate::operations::merge::{MergeBuilder, MergeSource};
use crate::operations::optimize::OptimizeBuilder;
use crate::operations::vacuum::VacuumBuilder;
use crate::operations::write::WriteBuilder;
use crate::snapshot::{Snapshot, VersionSelector};
use crate::value::{rows_to_batch, Row};

/// Builds a [`Table`] for a location.
#[derive(Debug, Clone)]
pub struct TableBuilder {
    location: String,
    registry: Option<Arc<StorageRegistry>>,
    storage_options: StorageOptions,
    storage: Option<TableStorage>,
    config: EngineConfig,
    selector: VersionSelector,
}

impl TableBuilder {
    /// Starts a builder for `location` (a URL or a filesystem path).
    #[must_use]
    pub fn from_uri(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            registry: None,
            storage_options: StorageOptions::new(),
            storage: None,
            config: EngineConfig::default(),
            selector: VersionSelector::Latest,
        }
    }

    /// Uses an already resolved table storage instead of the registry.
    #[must_use]
    pub fn from_storage(storage: TableStorage) -> Self {
        let mut builder = Self::from_uri(storage.uri());
        builder.storage = Some(storage);
        builder
    }

    /// Resolves the location through `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<StorageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Options passed to the backend factory.
    #[must_use]
    pub fn with_storage_options(mut self, options: StorageOptions) -> Self {
        self.storage_options = options;
        self
    }

    /// Engine configuration for operations on the table.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads an exact version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.selector = VersionSelector::Version(version);
        self
    }

    /// Loads the newest version committed at or before `at`.
    #[must_use]
    pub fn with_datestamp(mut self, at: DateTime<Utc>) -> Self {
        self.selector = VersionSelector::Timestamp(at);
        self
    }

    /// Builds the handle without reading the log.
    ///
    /// # Errors
    ///
    /// Returns storage errors for unresolvable locations.
    pub fn build(self) -> Result<Table> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => {
                let registry = self
                    .registry
                    .unwrap_or_else(|| Arc::new(StorageRegistry::with_defaults()));
                registry.resolve(&self.location, &self.storage_options)?
            }
        };
        Ok(Table {
            log: LogStore::new(storage),
            config: Arc::new(self.config),
            snapshot: None,
        })
    }

    /// Builds the handle and loads the selected version.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if there is no log and `VersionNotFound` for
    /// selectors outside the retained log.
    pub async fn load(self) -> Result<Table> {
        let selector = self.selector;
        let mut table = self.build()?;
        table.load_with(selector).await?;
        Ok(table)
    }
}

/// One commit as reported by [`Table::history`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Version of the commit.
    pub version: u64,
    /// Commit info recorded with it.
    pub info: CommitInfo,
}

/// Handle to a table location and the snapshot last loaded from it.
#[derive(Debug, Clone)]
pub struct Table {
    log: LogStore,
    config: Arc<EngineConfig>,
    snapshot: Option<Arc<Snapshot>>,
}

/// Opens the latest version of the table at `location` with default storage.
///
/// # Errors
///
/// Same as [`TableBuilder::load`].
pub async fn open_table(location: impl Into<String>) -> Result<Table> {
    TableBuilder::from_uri(location).load().await
}

impl Table {
    /// Table storage.
    #[must_use]
    pub fn storage(&self) -> &TableStorage {
        self.log.storage()
    }

    /// Transaction log.
    #[must_use]
    pub fn log(&self) -> &LogStore {
        &self.log
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Table URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        self.storage().uri()
    }

    /// Loaded version, `None` before a snapshot is loaded.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.version())
    }

    /// Loaded snapshot.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if no snapshot is loaded.
    pub fn snapshot(&self) -> Result<&Arc<Snapshot>> {
        self.snapshot.as_ref().ok_or_else(|| TableError::TableNotFound {
            location: self.uri().to_string(),
        })
    }

    pub(crate) fn with_snapshot(mut self, snapshot: Option<Arc<Snapshot>>) -> Self {
        if snapshot.is_some() {
            self.snapshot = snapshot;
        }
        self
    }

    /// Loads the newest version; a missing table yields `None` instead of
    /// an error.
    pub(crate) async fn latest_or_none(&self) -> Result<Option<Arc<Snapshot>>> {
        let latest = match &self.snapshot {
            Some(current) => current.refresh(&self.log).await,
            None => Snapshot::load(&self.log, VersionSelector::Latest).await,
        };
        match latest {
            Ok(snapshot) => Ok(Some(Arc::new(snapshot))),
            Err(TableError::TableNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load_with(&mut self, selector: VersionSelector) -> Result<()> {
        let snapshot = Snapshot::load(&self.log, selector).await?;
        debug!(uri = %self.uri(), version = snapshot.version(), "loaded snapshot");
        self.snapshot = Some(Arc::new(snapshot));
        Ok(())
    }

    /// Reloads to the newest version.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if there is no log.
    pub async fn update(&mut self) -> Result<()> {
        match &self.snapshot {
            Some(current) => {
                let next = current.refresh(&self.log).await?;
                self.snapshot = Some(Arc::new(next));
                Ok(())
            }
            None => self.load_with(VersionSelector::Latest).await,
        }
    }

    /// Loads an exact version.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotFound` outside the retained log.
    pub async fn load_version(&mut self, version: u64) -> Result<()> {
        self.load_with(VersionSelector::Version(version)).await
    }

    /// Loads the newest version committed at or before `at`.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotFound` if `at` precedes the retained log.
    pub async fn load_datetime(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.load_with(VersionSelector::Timestamp(at)).await
    }

    /// Whether a log exists at the location.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub async fn is_table(&self) -> Result<bool> {
        Ok(!self.log.listing().await?.is_empty())
    }

    /// Table metadata.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if no snapshot is loaded.
    pub fn metadata(&self) -> Result<&Metadata> {
        Ok(self.snapshot()?.metadata())
    }

    /// Table schema as Arrow.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if no snapshot is loaded.
    pub fn schema(&self) -> Result<SchemaRef> {
        Ok(self.snapshot()?.schema().to_arrow())
    }

    /// Number of active files.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if no snapshot is loaded.
    pub fn num_files(&self) -> Result<usize> {
        Ok(self.snapshot()?.num_files())
    }

    /// Fully qualified URIs of the active files.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if no snapshot is loaded.
    pub fn file_uris(&self) -> Result<Vec<String>> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .files()
            .map(|f| self.storage().file_uri(&f.path))
            .collect())
    }

    /// Commit history, newest first, at most `limit` entries.
    ///
    /// Only versions still present in the log are reported.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if there is no log.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let listing = self.log.listing().await?;
        if listing.is_empty() {
            return Err(TableError::TableNotFound {
                location: self.uri().to_string(),
            });
        }
        let mut out = Vec::new();
        for &version in listing.entries.keys().rev() {
            if limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            let info = self
                .log
                .read_entry(version)
                .await?
                .into_iter()
                .find_map(|a| match a {
                    Action::CommitInfo(info) => Some(info),
                    _ => None,
                });
            if let Some(info) = info {
                out.push(HistoryEntry { version, info });
            }
        }
        Ok(out)
    }

    /// Reads every active row in file path order.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if no snapshot is loaded, and read errors.
    pub async fn scan_rows(&self) -> Result<Vec<Row>> {
        let snapshot = self.snapshot()?.clone();
        let storage = self.storage().clone();
        let files: Vec<_> = snapshot.files().cloned().collect();
        let chunks: Vec<Vec<Row>> = futures::stream::iter(files)
            .map(|file| {
                let storage = storage.clone();
                let snapshot = snapshot.clone();
                async move {
                    read_rows(&storage, &file, snapshot.schema(), snapshot.partition_columns()).await
                }
            })
            .buffered(self.config.max_concurrent_reads.max(1))
            .try_collect()
            .await?;
        Ok(chunks.into_iter().flatten().collect())
    }

    /// Reads every active row as one batch in the table schema.
    ///
    /// # Errors
    ///
    /// Same as [`Self::scan_rows`].
    pub async fn scan(&self) -> Result<RecordBatch> {
        let rows = self.scan_rows().await?;
        let schema = self.snapshot()?.schema();
        let all: Vec<usize> = (0..schema.fields().len()).collect();
        rows_to_batch(&rows, schema, &all)
    }

    /// Starts a table creation.
    #[must_use]
    pub fn create(self) -> CreateBuilder {
        CreateBuilder::new(self)
    }

    /// Starts a write of `batches`.
    #[must_use]
    pub fn write(self, batches: impl IntoIterator<Item = RecordBatch>) -> WriteBuilder {
        WriteBuilder::new(self, batches)
    }

    /// Starts a merge of `source` into the table on `predicate`.
    #[must_use]
    pub fn merge(self, source: impl MergeSource + 'static, predicate: impl Into<String>) -> MergeBuilder {
        MergeBuilder::new(self, Arc::new(source), predicate)
    }

    /// Starts a vacuum.
    #[must_use]
    pub fn vacuum(self) -> VacuumBuilder {
        VacuumBuilder::new(self)
    }

    /// Starts a compaction.
    #[must_use]
    pub fn compact(self) -> OptimizeBuilder {
        OptimizeBuilder::new(self)
    }
}
