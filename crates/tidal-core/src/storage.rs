//! Object-store contract consumed by the table engine.
//!
//! Every backend must provide:
//! - whole-object and ranged reads
//! - writes guarded by a [`WritePrecondition`], where `DoesNotExist` is an
//!   atomic create-if-absent (the transaction log relies on it)
//! - prefix listing and metadata lookups
//! - idempotent deletes
//!
//! The version token in [`ObjectMeta`] is opaque. Backends choose their own
//! representation (a counter, a generation number, an mtime/size pair).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the object does not exist (atomic create-if-absent).
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current version token.
    PreconditionFailed {
        /// The version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key), relative to the backend root.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque version token for conditional writes.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
    /// Entity tag for cache validation.
    pub etag: Option<String>,
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Reads a byte range from an object.
    ///
    /// Returns `Error::InvalidInput` if start > object length or end < start.
    /// Clamps end to the object length.
    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes>;

    /// Writes with a precondition.
    ///
    /// A failed precondition is reported as `WriteResult::PreconditionFailed`,
    /// never as an error.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Succeeds if the object doesn't exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects whose path starts with `prefix`.
    ///
    /// Order is unspecified; callers needing order must sort.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend.
///
/// Cloning shares the underlying objects, so several handles (or several
/// tables opened through one registry) observe the same store.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    generation: u64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.generation.to_string(),
            last_modified: Some(self.last_modified),
            etag: Some(format!("\"{}\"", self.generation)),
        }
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_objects()?.len())
    }

    /// Returns true if nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read_objects()?.is_empty())
    }

    fn read_objects(&self) -> Result<RwLockReadGuard<'_, HashMap<String, StoredObject>>> {
        self.objects.read().map_err(|_| Error::Internal {
            message: "memory backend lock poisoned".into(),
        })
    }

    fn write_objects(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, StoredObject>>> {
        self.objects.write().map_err(|_| Error::Internal {
            message: "memory backend lock poisoned".into(),
        })
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.read_objects()?
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let data = self.get(path).await?;
        let (start, end) = clamp_range(&range, data.len())?;
        Ok(data.slice(start..end))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.write_objects()?;
        let current = objects.get(path);

        match (&precondition, current) {
            (WritePrecondition::DoesNotExist, Some(obj)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: obj.generation.to_string(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(obj))
                if *expected != obj.generation.to_string() =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: obj.generation.to_string(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
            _ => {}
        }

        let generation = current.map_or(1, |o| o.generation + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                generation,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: generation.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.write_objects()?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .read_objects()?
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.read_objects()?.get(path).map(|obj| obj.meta(path)))
    }
}

/// Validates a byte range against an object length, clamping the end.
pub(crate) fn clamp_range(range: &Range<u64>, len: usize) -> Result<(usize, usize)> {
    let start = usize::try_from(range.start).unwrap_or(usize::MAX);
    if start > len {
        return Err(Error::InvalidInput(format!(
            "range start {start} exceeds object length {len}"
        )));
    }
    let end = usize::try_from(range.end).unwrap_or(usize::MAX).min(len);
    if end < start {
        return Err(Error::InvalidInput(format!(
            "range end {end} is before start {start}"
        )));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("tbl/_tidal_log/0.json", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend
            .get("tbl/_tidal_log/0.json")
            .await
            .expect("get should succeed");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.get("nope").await.expect_err("missing object");
        assert!(err.is_not_found());
        assert!(backend.head("nope").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn test_get_range_clamps_and_validates() {
        let backend = MemoryBackend::new();
        backend
            .put("f", Bytes::from("hello world"), WritePrecondition::None)
            .await
            .expect("put");

        let head = backend.get_range("f", 0..5).await.expect("range");
        assert_eq!(head, Bytes::from("hello"));
        let tail = backend.get_range("f", 6..100).await.expect("clamped");
        assert_eq!(tail, Bytes::from("world"));

        assert!(backend.get_range("f", 100..200).await.is_err());
        assert!(backend.get_range("f", 8..2).await.is_err());
    }

    #[tokio::test]
    async fn test_create_if_absent_rejects_second_writer() {
        let backend = MemoryBackend::new();

        let first = backend
            .put("v1.json", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(first.is_success());

        let second = backend
            .put("v1.json", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(second, WriteResult::PreconditionFailed { .. }));
        assert_eq!(backend.get("v1.json").await.expect("get"), Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_concurrent_create_if_absent_has_single_winner() {
        let backend = MemoryBackend::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .put(
                        "race.json",
                        Bytes::from(format!("writer-{i}")),
                        WritePrecondition::DoesNotExist,
                    )
                    .await
                    .expect("put")
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join").is_success() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_precondition_matches_version() {
        let backend = MemoryBackend::new();

        let WriteResult::Success { version } = backend
            .put("gen.txt", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };

        let updated = backend
            .put(
                "gen.txt",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(version.clone()),
            )
            .await
            .expect("put");
        assert!(updated.is_success());

        let stale = backend
            .put(
                "gen.txt",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(version),
            )
            .await
            .expect("put");
        assert!(matches!(stale, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_list_prefix_and_delete() {
        let backend = MemoryBackend::new();
        for path in ["a/1.parquet", "a/2.parquet", "b/1.parquet"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        assert_eq!(backend.list("a/").await.expect("list").len(), 2);
        assert_eq!(backend.list("b/").await.expect("list").len(), 1);

        backend.delete("a/1.parquet").await.expect("delete");
        backend.delete("a/1.parquet").await.expect("idempotent delete");
        assert_eq!(backend.list("a/").await.expect("list").len(), 1);
        assert_eq!(backend.len().expect("len"), 2);
    }
}
