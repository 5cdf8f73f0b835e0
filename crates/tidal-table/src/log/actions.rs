//! Log actions and their NDJSON encoding.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TableError};
use crate::schema::Schema;

/// Partition column name to its textual value; `None` is SQL `NULL`.
pub type PartitionValues = BTreeMap<String, Option<String>>;

/// One line of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// A data file became active.
    Add(AddFile),
    /// A data file stopped being active.
    Remove(RemoveFile),
    /// Table metadata replaced as a whole.
    MetaData(Metadata),
    /// Provenance of the commit.
    CommitInfo(CommitInfo),
}

/// Per-file statistics collected at write time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    /// Rows in the file.
    pub num_records: u64,
    /// Null count per column.
    #[serde(default)]
    pub null_count: BTreeMap<String, u64>,
    /// Minimum per orderable column, in partition-value text form.
    #[serde(default)]
    pub min_values: BTreeMap<String, String>,
    /// Maximum per orderable column, in partition-value text form.
    #[serde(default)]
    pub max_values: BTreeMap<String, String>,
}

/// An active data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFile {
    /// Table-relative path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Values of the partition columns for every row in the file.
    #[serde(default)]
    pub partition_values: PartitionValues,
    /// Write time (ms since epoch).
    pub modification_time: i64,
    /// False when the file only rearranges existing rows.
    pub data_change: bool,
    /// Statistics, if collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FileStats>,
    /// Version that added the file; filled in at commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_version: Option<u64>,
}

impl AddFile {
    /// Row count from statistics, if present.
    #[must_use]
    pub fn num_records(&self) -> Option<u64> {
        self.stats.as_ref().map(|s| s.num_records)
    }

    /// Builds the matching removal.
    #[must_use]
    pub fn remove(&self, deletion_timestamp: i64, data_change: bool) -> RemoveFile {
        RemoveFile {
            path: self.path.clone(),
            deletion_timestamp,
            data_change,
            partition_values: self.partition_values.clone(),
            size: Some(self.size),
        }
    }
}

/// A data file removed from the table; kept as a tombstone for vacuum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFile {
    /// Table-relative path.
    pub path: String,
    /// Removal time (ms since epoch).
    pub deletion_timestamp: i64,
    /// False when the removal only rearranges existing rows.
    pub data_change: bool,
    /// Partition values of the removed file.
    #[serde(default)]
    pub partition_values: PartitionValues,
    /// Size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Table id (UUID v7).
    pub id: String,
    /// Optional name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Column schema.
    pub schema: Schema,
    /// Partition columns, in directory order.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Table properties.
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    /// Creation time (ms since epoch).
    pub created_time: i64,
}

/// Provenance recorded with every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    /// Commit time (ms since epoch); strictly increasing across versions.
    pub timestamp: i64,
    /// Operation name, e.g. `MERGE`.
    pub operation: String,
    /// Operation parameters.
    #[serde(default)]
    pub operation_parameters: BTreeMap<String, serde_json::Value>,
    /// Committing user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Committing user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Engine name and version.
    pub engine_info: String,
    /// Version the commit was planned against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<u64>,
    /// Operation metrics.
    #[serde(default)]
    pub operation_metrics: BTreeMap<String, serde_json::Value>,
}

/// Engine identifier written into [`CommitInfo::engine_info`].
pub const ENGINE_INFO: &str = concat!("tidal/", env!("CARGO_PKG_VERSION"));

/// Encodes actions as newline-delimited JSON.
///
/// # Errors
///
/// Returns `Serialization` if an action cannot be encoded.
pub fn encode_entry(actions: &[Action]) -> Result<Bytes> {
    let mut out = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut out, action)?;
        out.push(b'\n');
    }
    Ok(Bytes::from(out))
}

/// Decodes a newline-delimited JSON entry. Blank lines are skipped.
///
/// # Errors
///
/// Returns `Serialization` naming the offending line.
pub fn decode_entry(bytes: &[u8]) -> Result<Vec<Action>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TableError::serialization(format!("log entry is not UTF-8: {e}")))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                TableError::serialization(format!("log entry line {}: {e}", n + 1))
            })
        })
        .collect()
}
