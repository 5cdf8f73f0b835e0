//! Storage scoped to one table root.
//!
//! All table paths (log entries, checkpoints, data files) are relative to the
//! table root. This wrapper joins them onto the backend prefix resolved from
//! the table URI and strips the prefix back off listing results.
//!
//! Relative paths are validated:
//! - absolute paths and backslashes are rejected
//! - `.` and `..` segments are rejected
//! - control characters are rejected
//!
//! `%` is allowed since Hive partition directories escape unsafe characters
//! as `%XX`.

use bytes::Bytes;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// A storage backend scoped to a table root.
#[derive(Clone)]
pub struct TableStorage {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    uri: String,
}

impl fmt::Debug for TableStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableStorage")
            .field("prefix", &self.prefix)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl TableStorage {
    /// Creates a table storage over `backend`, rooted at `prefix`.
    ///
    /// `uri` is the user-facing table location, used to build file URIs.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        prefix: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        let uri = uri.into().trim_end_matches('/').to_string();
        Self {
            backend,
            prefix,
            uri,
        }
    }

    /// Returns the table URI (without trailing slash).
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Returns the fully qualified URI of a table-relative path.
    #[must_use]
    pub fn file_uri(&self, path: &str) -> String {
        format!("{}/{}", self.uri, path)
    }

    fn validate_path(path: &str) -> Result<()> {
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::InvalidInput(format!(
                "absolute paths not allowed: {path}"
            )));
        }
        if path.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "backslashes not allowed in paths: {path}"
            )));
        }
        if path.chars().any(char::is_control) {
            return Err(Error::InvalidInput(format!(
                "control characters not allowed in paths: {path:?}"
            )));
        }
        if path.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(Error::InvalidInput(format!(
                "path traversal not allowed: {path}"
            )));
        }
        Ok(())
    }

    fn full_path(&self, path: &str) -> Result<String> {
        Self::validate_path(path)?;
        if self.prefix.is_empty() {
            Ok(path.to_string())
        } else {
            Ok(format!("{}/{path}", self.prefix))
        }
    }

    fn strip_prefix(&self, mut meta: ObjectMeta) -> ObjectMeta {
        if !self.prefix.is_empty() {
            if let Some(rest) = meta
                .path
                .strip_prefix(self.prefix.as_str())
                .and_then(|p| p.strip_prefix('/'))
            {
                meta.path = rest.to_string();
            }
        }
        meta
    }

    /// Reads an entire object.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    pub async fn get(&self, path: &str) -> Result<Bytes> {
        self.backend.get(&self.full_path(path)?).await
    }

    /// Reads a byte range of an object.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        self.backend.get_range(&self.full_path(path)?, range).await
    }

    /// Writes an object with a precondition.
    ///
    /// # Errors
    ///
    /// Propagates backend errors. A failed precondition is a normal result.
    pub async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.backend
            .put(&self.full_path(path)?, data, precondition)
            .await
    }

    /// Writes an object only if it does not exist yet.
    ///
    /// Returns `true` if this call created the object.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn create_if_absent(&self, path: &str, data: Bytes) -> Result<bool> {
        Ok(self
            .put(path, data, WritePrecondition::DoesNotExist)
            .await?
            .is_success())
    }

    /// Deletes an object. Missing objects are not an error.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.backend.delete(&self.full_path(path)?).await
    }

    /// Lists objects under a table-relative prefix; returned paths are
    /// table-relative.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let full = if prefix.is_empty() {
            if self.prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", self.prefix)
            }
        } else {
            self.full_path(prefix)?
        };
        Ok(self
            .backend
            .list(&full)
            .await?
            .into_iter()
            .map(|meta| self.strip_prefix(meta))
            .collect())
    }

    /// Gets object metadata.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.backend.head(&self.full_path(path)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn scoped(backend: &MemoryBackend) -> TableStorage {
        TableStorage::new(
            Arc::new(backend.clone()),
            "warehouse/orders",
            "memory://warehouse/orders/",
        )
    }

    #[tokio::test]
    async fn test_paths_are_prefixed_and_stripped() {
        let backend = MemoryBackend::new();
        let storage = scoped(&backend);

        storage
            .put("_tidal_log/0.json", Bytes::from("{}"), WritePrecondition::None)
            .await
            .expect("put");
        assert!(backend
            .head("warehouse/orders/_tidal_log/0.json")
            .await
            .expect("head")
            .is_some());

        let listed = storage.list("_tidal_log/").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "_tidal_log/0.json");
    }

    #[tokio::test]
    async fn test_list_root_does_not_leak_sibling_tables() {
        let backend = MemoryBackend::new();
        backend
            .put("warehouse/orders_v2/a.parquet", Bytes::from("x"), WritePrecondition::None)
            .await
            .expect("put");
        let storage = scoped(&backend);
        storage
            .put("a.parquet", Bytes::from("x"), WritePrecondition::None)
            .await
            .expect("put");

        let listed = storage.list("").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "a.parquet");
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let storage = scoped(&MemoryBackend::new());
        assert!(storage
            .create_if_absent("v.json", Bytes::from("1"))
            .await
            .expect("create"));
        assert!(!storage
            .create_if_absent("v.json", Bytes::from("2"))
            .await
            .expect("create"));
    }

    #[test]
    fn test_rejects_unsafe_paths() {
        for path in ["/abs", "a/../b", "./a", "a\\b", "a\nb"] {
            assert!(TableStorage::validate_path(path).is_err(), "{path}");
        }
        assert!(TableStorage::validate_path("city=New%20York/part-1.parquet").is_ok());
    }

    #[test]
    fn test_file_uri() {
        let storage = scoped(&MemoryBackend::new());
        assert_eq!(
            storage.file_uri("x=1/part-a.parquet"),
            "memory://warehouse/orders/x=1/part-a.parquet"
        );
    }
}
