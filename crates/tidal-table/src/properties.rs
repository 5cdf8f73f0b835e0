//! Table properties stored in [`Metadata::configuration`](crate::log::Metadata).

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Duration;

use crate::error::{Result, TableError};

/// Commits between checkpoints.
pub const CHECKPOINT_INTERVAL: &str = "checkpoint.interval";
/// Hours log entries and tombstones are kept after a checkpoint.
pub const LOG_RETENTION_HOURS: &str = "log.retentionHours";
/// Whether expired log entries are deleted after checkpoints.
pub const ENABLE_EXPIRED_LOG_CLEANUP: &str = "log.enableExpiredLogCleanup";
/// Minimum vacuum retention in hours.
pub const VACUUM_MIN_RETENTION_HOURS: &str = "vacuum.minRetentionHours";

const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;
const DEFAULT_LOG_RETENTION_HOURS: i64 = 720;
const DEFAULT_VACUUM_MIN_RETENTION_HOURS: i64 = 168;

/// Parsed table properties with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableProperties {
    /// Checkpoint every this many versions.
    pub checkpoint_interval: u64,
    /// Log and tombstone retention.
    pub log_retention_hours: i64,
    /// Whether cleanup runs after checkpoints.
    pub enable_expired_log_cleanup: bool,
    /// Vacuum retention floor.
    pub vacuum_min_retention_hours: i64,
}

impl Default for TableProperties {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            log_retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            enable_expired_log_cleanup: true,
            vacuum_min_retention_hours: DEFAULT_VACUUM_MIN_RETENTION_HOURS,
        }
    }
}

impl TableProperties {
    /// Parses known keys; unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unparsable or out-of-range values.
    pub fn from_configuration(configuration: &BTreeMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let properties = Self {
            checkpoint_interval: parse(configuration, CHECKPOINT_INTERVAL)?
                .unwrap_or(defaults.checkpoint_interval),
            log_retention_hours: parse(configuration, LOG_RETENTION_HOURS)?
                .unwrap_or(defaults.log_retention_hours),
            enable_expired_log_cleanup: parse(configuration, ENABLE_EXPIRED_LOG_CLEANUP)?
                .unwrap_or(defaults.enable_expired_log_cleanup),
            vacuum_min_retention_hours: parse(configuration, VACUUM_MIN_RETENTION_HOURS)?
                .unwrap_or(defaults.vacuum_min_retention_hours),
        };
        if properties.checkpoint_interval == 0 {
            return Err(TableError::validation(format!(
                "{CHECKPOINT_INTERVAL} must be positive"
            )));
        }
        if properties.log_retention_hours < 0 || properties.vacuum_min_retention_hours < 0 {
            return Err(TableError::validation("retention hours must not be negative"));
        }
        Ok(properties)
    }

    /// Log retention as a duration.
    #[must_use]
    pub fn log_retention(&self) -> Duration {
        Duration::try_hours(self.log_retention_hours).unwrap_or(Duration::MAX)
    }

    /// Validates a configuration map without keeping the result.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_configuration`].
    pub fn validate(configuration: &BTreeMap<String, String>) -> Result<()> {
        Self::from_configuration(configuration).map(|_| ())
    }
}

fn parse<T: FromStr>(configuration: &BTreeMap<String, String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    configuration
        .get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                TableError::validation(format!("invalid value `{raw}` for {key}: {e}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_for_missing_keys() {
        let properties = TableProperties::from_configuration(&BTreeMap::new()).unwrap();
        assert_eq!(properties, TableProperties::default());
        assert_eq!(properties.checkpoint_interval, 10);
        assert_eq!(properties.log_retention(), Duration::hours(720));
    }

    #[test]
    fn test_overrides_and_errors() {
        let configuration = BTreeMap::from([
            (CHECKPOINT_INTERVAL.to_string(), "2".to_string()),
            (ENABLE_EXPIRED_LOG_CLEANUP.to_string(), "false".to_string()),
            ("owner".to_string(), "analytics".to_string()),
        ]);
        let properties = TableProperties::from_configuration(&configuration).unwrap();
        assert_eq!(properties.checkpoint_interval, 2);
        assert!(!properties.enable_expired_log_cleanup);

        let bad = BTreeMap::from([(CHECKPOINT_INTERVAL.to_string(), "0".to_string())]);
        assert!(matches!(
            TableProperties::from_configuration(&bad),
            Err(TableError::Validation { .. })
        ));
        let bad = BTreeMap::from([(VACUUM_MIN_RETENTION_HOURS.to_string(), "a week".to_string())]);
        assert!(TableProperties::validate(&bad).is_err());
    }
}
