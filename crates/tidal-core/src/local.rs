//! Local filesystem storage backend.
//!
//! Objects map to files under a root directory. Writes go to a hidden
//! temporary file first and are then published:
//! - `DoesNotExist` publishes with `hard_link`, which fails atomically when
//!   the destination exists
//! - `None` publishes with `rename`, replacing any previous object
//! - `MatchesVersion` compares the current version token and renames; the
//!   check is serialized within this process only
//!
//! Version tokens are `{mtime_nanos}-{size}`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::{ErrorKind, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::{clamp_range, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

const TEMP_PREFIX: &str = ".tidal-tmp-";

/// Storage backend rooted at a local directory.
#[derive(Debug)]
pub struct LocalFsBackend {
    root: PathBuf,
    cas_guard: Mutex<()>,
}

impl LocalFsBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily
    /// on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cas_guard: Mutex::new(()),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(Error::InvalidInput("empty object path".into()));
        }
        if path.split('/').any(|segment| segment == "..") {
            return Err(Error::InvalidInput(format!(
                "path traversal not allowed: {path}"
            )));
        }
        Ok(self.root.join(path.trim_start_matches('/')))
    }

    async fn stage(&self, target: &Path, data: &[u8]) -> Result<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("no parent for {}", target.display())))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::storage_with_source(format!("create {}", parent.display()), e))?;

        let temp = parent.join(format!("{TEMP_PREFIX}{}", ulid::Ulid::new()));
        tokio::fs::write(&temp, data)
            .await
            .map_err(|e| Error::storage_with_source(format!("write {}", temp.display()), e))?;
        Ok(temp)
    }

    async fn meta_for(&self, relative: &str, path: &Path) -> Result<Option<ObjectMeta>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(object_meta(relative, &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("stat {}", path.display()),
                e,
            )),
        }
    }

    async fn publish_replace(&self, temp: &Path, target: &Path) -> Result<WriteResult> {
        tokio::fs::rename(temp, target)
            .await
            .map_err(|e| Error::storage_with_source(format!("rename to {}", target.display()), e))?;
        let meta = tokio::fs::metadata(target)
            .await
            .map_err(|e| Error::storage_with_source(format!("stat {}", target.display()), e))?;
        Ok(WriteResult::Success {
            version: version_token(&meta),
        })
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {path}")))
            }
            Err(e) => Err(Error::storage_with_source(format!("read {path}"), e)),
        }
    }

    async fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let file_path = self.resolve(path)?;
        let mut file = match tokio::fs::File::open(&file_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("object not found: {path}")));
            }
            Err(e) => return Err(Error::storage_with_source(format!("open {path}"), e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::storage_with_source(format!("stat {path}"), e))?
            .len();
        let (start, end) = clamp_range(&range, usize::try_from(len).unwrap_or(usize::MAX))?;

        file.seek(SeekFrom::Start(start as u64))
            .await
            .map_err(|e| Error::storage_with_source(format!("seek {path}"), e))?;
        let mut buf = vec![0_u8; end - start];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Error::storage_with_source(format!("read {path}"), e))?;
        Ok(Bytes::from(buf))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let target = self.resolve(path)?;
        let temp = self.stage(&target, &data).await?;

        let result = match precondition {
            WritePrecondition::DoesNotExist => match tokio::fs::hard_link(&temp, &target).await {
                Ok(()) => {
                    let meta = tokio::fs::metadata(&target).await.map_err(|e| {
                        Error::storage_with_source(format!("stat {path}"), e)
                    })?;
                    Ok(WriteResult::Success {
                        version: version_token(&meta),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let current = self.meta_for(path, &target).await?;
                    Ok(WriteResult::PreconditionFailed {
                        current_version: current.map_or_else(String::new, |m| m.version),
                    })
                }
                Err(e) => Err(Error::storage_with_source(format!("link {path}"), e)),
            },
            WritePrecondition::MatchesVersion(expected) => {
                let _guard = self.cas_guard.lock().await;
                match self.meta_for(path, &target).await? {
                    Some(current) if current.version == expected => {
                        return self.publish_replace(&temp, &target).await;
                    }
                    current => Ok(WriteResult::PreconditionFailed {
                        current_version: current.map_or_else(|| "0".to_string(), |m| m.version),
                    }),
                }
            }
            WritePrecondition::None => return self.publish_replace(&temp, &target).await,
        };

        if let Err(e) = tokio::fs::remove_file(&temp).await {
            tracing::debug!(path = %temp.display(), error = %e, "failed to remove staging file");
        }
        result
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.resolve(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(format!("delete {path}"), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut results = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, relative_dir)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("list {}", dir.display()),
                        e,
                    ));
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source(format!("list {}", dir.display()), e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let relative = format!("{relative_dir}{name}");
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Error::storage_with_source(format!("stat {relative}"), e))?;

                if meta.is_dir() {
                    let child = format!("{relative}/");
                    // Only descend into directories that can contain matches.
                    if child.starts_with(prefix) || prefix.starts_with(&child) {
                        pending.push((entry.path(), child));
                    }
                } else if relative.starts_with(prefix) {
                    results.push(object_meta(&relative, &meta));
                }
            }
        }

        Ok(results)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let file = self.resolve(path)?;
        self.meta_for(path, &file).await
    }
}

fn version_token(meta: &std::fs::Metadata) -> String {
    let nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    format!("{nanos}-{}", meta.len())
}

fn object_meta(path: &str, meta: &std::fs::Metadata) -> ObjectMeta {
    let version = version_token(meta);
    ObjectMeta {
        path: path.to_string(),
        size: meta.len(),
        etag: Some(format!("\"{version}\"")),
        version,
        last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}
