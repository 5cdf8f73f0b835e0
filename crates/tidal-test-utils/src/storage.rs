//! Recording storage backend.
//!
//! [`TracingMemoryBackend`] keeps objects in memory like
//! `tidal_core::MemoryBackend` and additionally records every call, so tests
//! can assert which objects an operation read, wrote or deleted.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tidal_core::error::{Error, Result};
use tidal_core::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// One recorded storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Whole-object read.
    Get {
        /// Object path.
        path: String,
    },
    /// Ranged read.
    GetRange {
        /// Object path.
        path: String,
        /// Requested range.
        range: Range<u64>,
    },
    /// Metadata lookup.
    Head {
        /// Object path.
        path: String,
    },
    /// Write, applied or not.
    Put {
        /// Object path.
        path: String,
        /// Payload size.
        size: usize,
        /// Precondition sent with the write.
        precondition: WritePrecondition,
    },
    /// Delete.
    Delete {
        /// Object path.
        path: String,
    },
    /// Prefix listing.
    List {
        /// Listed prefix.
        prefix: String,
    },
}

impl StorageOp {
    /// Whether the call can change the store.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Put { .. } | Self::Delete { .. })
    }

    /// Path or prefix the call addressed.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::GetRange { path, .. }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path } => path,
            Self::List { prefix } => prefix,
        }
    }
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

/// In-memory backend that records calls and can fail on demand.
///
/// Clones share objects, the call log and injected failures.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that sleeps for `latency` before every call.
    ///
    /// Useful for widening race windows between concurrent writers.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Calls recorded so far, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Recorded calls that could change the store.
    #[must_use]
    pub fn mutations(&self) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(StorageOp::is_mutation)
            .collect()
    }

    /// Forgets recorded calls.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Makes every call on a path starting with `prefix` fail.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().expect("lock").push(prefix.into());
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().expect("lock").clear();
    }

    /// Stored paths in lexicographic order.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().expect("lock").keys().cloned().collect()
    }

    /// Whether `path` is stored.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().expect("lock").contains_key(path)
    }

    /// Stores `data` at `path` without recording the call.
    pub fn seed(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        let mut objects = self.objects.lock().expect("lock");
        let path = path.into();
        let generation = objects.get(&path).map_or(1, |o| o.generation + 1);
        objects.insert(
            path,
            StoredObject {
                data: data.into(),
                generation,
                last_modified: Utc::now(),
            },
        );
    }

    async fn enter(&self, op: StorageOp) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .fail_prefixes
            .lock()
            .expect("lock")
            .iter()
            .any(|prefix| op.path().starts_with(prefix.as_str()));
        let path = op.path().to_string();
        self.operations.lock().expect("lock").push(op);
        if failing {
            return Err(Error::storage(format!("injected failure for {path}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.enter(StorageOp::Get {
            path: path.to_string(),
        })
        .await?;
        self.objects
            .lock()
            .expect("lock")
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        self.enter(StorageOp::GetRange {
            path: path.to_string(),
            range: range.clone(),
        })
        .await?;
        if range.end < range.start {
            return Err(Error::InvalidInput(format!(
                "range end {} precedes start {}",
                range.end, range.start
            )));
        }
        let objects = self.objects.lock().expect("lock");
        let object = objects
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let len = object.data.len() as u64;
        if range.start > len {
            return Err(Error::InvalidInput(format!(
                "range start {} is past object length {len}",
                range.start
            )));
        }
        let start = usize::try_from(range.start).expect("range fits in memory");
        let end = usize::try_from(range.end.min(len)).expect("range fits in memory");
        Ok(object.data.slice(start..end))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.enter(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        })
        .await?;

        let mut objects = self.objects.lock().expect("lock");
        let existing = objects.get(path).map(|o| o.generation);
        let failed = |current: Option<u64>| WriteResult::PreconditionFailed {
            current_version: current.map_or_else(|| "0".to_string(), |g| g.to_string()),
        };
        match (&precondition, existing) {
            (WritePrecondition::DoesNotExist, Some(current)) => return Ok(failed(Some(current))),
            (WritePrecondition::MatchesVersion(expected), current)
                if current.map(|g| g.to_string()).as_ref() != Some(expected) =>
            {
                return Ok(failed(current));
            }
            _ => {}
        }

        let generation = existing.map_or(1, |g| g + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                generation,
                last_modified: Utc::now(),
            },
        );
        Ok(WriteResult::Success {
            version: generation.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.enter(StorageOp::Delete {
            path: path.to_string(),
        })
        .await?;
        self.objects.lock().expect("lock").remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.enter(StorageOp::List {
            prefix: prefix.to_string(),
        })
        .await?;
        Ok(self
            .objects
            .lock()
            .expect("lock")
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, object)| object.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.enter(StorageOp::Head {
            path: path.to_string(),
        })
        .await?;
        Ok(self
            .objects
            .lock()
            .expect("lock")
            .get(path)
            .map(|object| object.meta(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order() {
        let storage = TracingMemoryBackend::new();
        storage
            .put("a/1", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();
        storage.get("a/1").await.unwrap();
        storage.list("a/").await.unwrap();

        let ops = storage.operations();
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], StorageOp::Put { .. }));
        assert!(matches!(ops[1], StorageOp::Get { .. }));
        assert!(matches!(ops[2], StorageOp::List { .. }));
        assert_eq!(storage.mutations().len(), 1);
    }

    #[tokio::test]
    async fn create_if_absent_rejects_second_writer() {
        let storage = TracingMemoryBackend::new();
        let first = storage
            .put("log/0", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        let second = storage
            .put("log/0", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(first.is_success());
        assert_eq!(
            second,
            WriteResult::PreconditionFailed {
                current_version: "1".into()
            }
        );
        assert_eq!(storage.get("log/0").await.unwrap(), Bytes::from("a"));
    }

    #[tokio::test]
    async fn injected_failures_match_prefixes() {
        let storage = TracingMemoryBackend::new();
        storage.seed("ok/1", "data");
        storage.inject_failure("bad/");

        assert!(storage.get("bad/1").await.is_err());
        assert!(storage.get("ok/1").await.is_ok());

        storage.clear_failures();
        assert!(storage.get("bad/1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_only_returns_prefix_matches() {
        let storage = TracingMemoryBackend::new();
        storage.seed("t/a", "1");
        storage.seed("t/b", "22");
        storage.seed("u/a", "3");

        let listed = storage.list("t/").await.unwrap();
        let paths: Vec<_> = listed.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, ["t/a", "t/b"]);
        assert_eq!(listed[1].size, 2);
    }
}
