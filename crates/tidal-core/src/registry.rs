//! Resolution of table URIs to storage backends.
//!
//! A [`StorageRegistry`] maps URI schemes to [`BackendFactory`] values. It is
//! an explicit value passed into table construction; nothing is registered
//! globally. [`StorageRegistry::with_defaults`] registers:
//! - `memory`: one shared [`MemoryBackend`] per registry, keyed by
//!   `host/path`
//! - `file`: a [`LocalFsBackend`] rooted at the URI path
//!
//! Locations that do not parse as URLs are treated as filesystem paths.
//! Relative paths are resolved against the current directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::error::{Error, Result};
use crate::local::LocalFsBackend;
use crate::storage::{MemoryBackend, StorageBackend};
use crate::table_storage::TableStorage;

/// Opaque backend options (credentials, endpoints, tuning), passed through
/// to the factory untouched.
pub type StorageOptions = HashMap<String, String>;

/// Builds a backend for a parsed table URL.
pub trait BackendFactory: Send + Sync {
    /// Returns the backend and the object-key prefix of the table root.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL or options are unusable by this backend.
    fn build(
        &self,
        url: &Url,
        options: &StorageOptions,
    ) -> Result<(Arc<dyn StorageBackend>, String)>;
}

/// Factory for `memory://` URIs. All tables resolved through the same
/// factory share one store.
#[derive(Debug, Default, Clone)]
pub struct MemoryFactory {
    store: MemoryBackend,
}

impl MemoryFactory {
    /// Creates a factory over an existing memory backend.
    #[must_use]
    pub fn new(store: MemoryBackend) -> Self {
        Self { store }
    }

    /// Returns the shared store.
    #[must_use]
    pub fn store(&self) -> &MemoryBackend {
        &self.store
    }
}

impl BackendFactory for MemoryFactory {
    fn build(
        &self,
        url: &Url,
        _options: &StorageOptions,
    ) -> Result<(Arc<dyn StorageBackend>, String)> {
        let host = url.host_str().unwrap_or_default();
        let prefix = format!("{host}{}", url.path());
        Ok((Arc::new(self.store.clone()), prefix))
    }
}

/// Factory for `file://` URIs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFsFactory;

impl BackendFactory for LocalFsFactory {
    fn build(
        &self,
        url: &Url,
        _options: &StorageOptions,
    ) -> Result<(Arc<dyn StorageBackend>, String)> {
        let root = url
            .to_file_path()
            .map_err(|()| Error::InvalidInput(format!("not a local file URL: {url}")))?;
        Ok((Arc::new(LocalFsBackend::new(root)), String::new()))
    }
}

/// Scheme to backend factory map.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("StorageRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

impl StorageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the `memory` and `file` schemes registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", Arc::new(MemoryFactory::default()));
        registry.register("file", Arc::new(LocalFsFactory));
        registry
    }

    /// Registers (or replaces) the factory for a scheme.
    pub fn register(&mut self, scheme: impl Into<String>, factory: Arc<dyn BackendFactory>) {
        self.factories
            .insert(scheme.into().to_ascii_lowercase(), factory);
    }

    /// Returns true if a factory is registered for `scheme`.
    #[must_use]
    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Resolves a table location to scoped table storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the location cannot be parsed or its
    /// scheme has no registered factory.
    pub fn resolve(&self, location: &str, options: &StorageOptions) -> Result<TableStorage> {
        let url = parse_location(location)?;
        let factory = self.factories.get(url.scheme()).ok_or_else(|| {
            Error::InvalidInput(format!(
                "no storage backend registered for scheme '{}'",
                url.scheme()
            ))
        })?;
        let (backend, prefix) = factory.build(&url, options)?;
        tracing::debug!(location, scheme = url.scheme(), prefix = %prefix, "resolved table storage");
        Ok(TableStorage::new(backend, prefix, url.as_str()))
    }
}

/// Parses a location as a URL, falling back to a filesystem path.
///
/// # Errors
///
/// Returns `Error::InvalidInput` for empty locations or paths that cannot be
/// expressed as `file://` URLs.
pub fn parse_location(location: &str) -> Result<Url> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("table location is empty".into()));
    }

    // Single-letter schemes are Windows drive letters, not URLs.
    if let Ok(url) = Url::parse(trimmed) {
        if url.scheme().len() > 1 {
            return Ok(url);
        }
    }

    let mut path = PathBuf::from(trimmed);
    if !path.is_absolute() {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::storage_with_source("resolve current directory", e))?;
        path = cwd.join(path);
    }
    Url::from_directory_path(&path)
        .map_err(|()| Error::InvalidInput(format!("invalid table path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_parse_location_accepts_urls_and_paths() {
        let url = parse_location("memory://bucket/tables/t1").expect("url");
        assert_eq!(url.scheme(), "memory");

        let path = parse_location("/tmp/tables/t1").expect("path");
        assert_eq!(path.scheme(), "file");
        assert!(path.path().ends_with("/tmp/tables/t1/"));

        assert!(parse_location("   ").is_err());
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let registry = StorageRegistry::with_defaults();
        let err = registry
            .resolve("s3://bucket/t", &StorageOptions::new())
            .expect_err("s3 is not registered");
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains("s3")));
    }

    #[tokio::test]
    async fn test_memory_tables_share_registry_store() {
        let registry = StorageRegistry::with_defaults();
        let a = registry
            .resolve("memory://wh/t1", &StorageOptions::new())
            .expect("resolve");
        let b = registry
            .resolve("memory://wh/t1", &StorageOptions::new())
            .expect("resolve");

        a.put("f.json", Bytes::from("1"), crate::storage::WritePrecondition::None)
            .await
            .expect("put");
        assert_eq!(b.get("f.json").await.expect("get"), Bytes::from("1"));
    }

    #[tokio::test]
    async fn test_file_scheme_roots_backend_at_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = StorageRegistry::with_defaults();
        let storage = registry
            .resolve(&dir.path().display().to_string(), &StorageOptions::new())
            .expect("resolve");

        storage
            .put("x=1/a.parquet", Bytes::from("x"), crate::storage::WritePrecondition::None)
            .await
            .expect("put");
        assert!(dir.path().join("x=1").join("a.parquet").exists());
    }
}
