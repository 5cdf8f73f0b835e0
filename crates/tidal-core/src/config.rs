//! Engine configuration.
//!
//! Defaults are suitable for tests and small deployments. Every field can be
//! overridden from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `TIDAL_MAX_COMMIT_ATTEMPTS` | `max_commit_attempts` |
//! | `TIDAL_TARGET_FILE_SIZE` | `target_file_size` |
//! | `TIDAL_SOURCE_BATCH_SIZE` | `source_batch_size` |
//! | `TIDAL_MAX_CONCURRENT_READS` | `max_concurrent_reads` |
//! | `TIDAL_USER_ID` | `user_id` |
//! | `TIDAL_USER_NAME` | `user_name` |

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of commit attempts before giving up on a contended log.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 15;
/// Default target size of written data files (100 MiB).
pub const DEFAULT_TARGET_FILE_SIZE: u64 = 100 * 1024 * 1024;
/// Default number of source rows evaluated per merge chunk.
pub const DEFAULT_SOURCE_BATCH_SIZE: usize = 8192;
/// Default fan-out for concurrent data file reads.
pub const DEFAULT_MAX_CONCURRENT_READS: usize = 8;

/// Tuning knobs shared by all table operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Commit attempts (first try plus retries) before
    /// `ConcurrentModificationExceeded`.
    pub max_commit_attempts: u32,
    /// Data files are rolled over once they reach roughly this many bytes.
    pub target_file_size: u64,
    /// Source rows evaluated per merge chunk.
    pub source_batch_size: usize,
    /// Maximum data files read concurrently.
    pub max_concurrent_reads: usize,
    /// Recorded in commit info.
    pub user_id: Option<String>,
    /// Recorded in commit info.
    pub user_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            target_file_size: DEFAULT_TARGET_FILE_SIZE,
            source_batch_size: DEFAULT_SOURCE_BATCH_SIZE,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            user_id: None,
            user_name: None,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `TIDAL_*` environment variables on top of the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a variable is set but malformed or
    /// out of range.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`EngineConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a variable is malformed or out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvReader { lookup: &lookup };
        let mut config = Self::default();

        if let Some(attempts) = env.u64("TIDAL_MAX_COMMIT_ATTEMPTS")? {
            config.max_commit_attempts = u32::try_from(attempts).map_err(|_| {
                Error::InvalidInput("TIDAL_MAX_COMMIT_ATTEMPTS is too large".into())
            })?;
        }
        if let Some(size) = env.u64("TIDAL_TARGET_FILE_SIZE")? {
            config.target_file_size = size;
        }
        if let Some(rows) = env.usize("TIDAL_SOURCE_BATCH_SIZE")? {
            config.source_batch_size = rows;
        }
        if let Some(reads) = env.usize("TIDAL_MAX_CONCURRENT_READS")? {
            config.max_concurrent_reads = reads;
        }
        config.user_id = env.string("TIDAL_USER_ID");
        config.user_name = env.string("TIDAL_USER_NAME");

        config.validate()?;
        Ok(config)
    }

    /// Checks that every knob is usable.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_commit_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_commit_attempts must be at least 1".into(),
            ));
        }
        if self.target_file_size == 0 {
            return Err(Error::InvalidInput(
                "target_file_size must be positive".into(),
            ));
        }
        if self.source_batch_size == 0 {
            return Err(Error::InvalidInput(
                "source_batch_size must be positive".into(),
            ));
        }
        if self.max_concurrent_reads == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_reads must be positive".into(),
            ));
        }
        Ok(())
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
    }
}
