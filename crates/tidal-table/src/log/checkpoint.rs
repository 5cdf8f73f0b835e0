//! Checkpoints: the full table state at one version in a single document.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::actions::{AddFile, Metadata, RemoveFile};
use crate::error::Result;

/// Materialized state at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Version the state corresponds to.
    pub version: u64,
    /// Commit timestamp of `version` (ms since epoch).
    pub timestamp: i64,
    /// Metadata in effect.
    pub metadata: Metadata,
    /// Active files.
    pub files: Vec<AddFile>,
    /// Unexpired tombstones.
    #[serde(default)]
    pub tombstones: Vec<RemoveFile>,
}

impl Checkpoint {
    /// Encodes the checkpoint as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` on encoding failure.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a checkpoint document.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the document is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
