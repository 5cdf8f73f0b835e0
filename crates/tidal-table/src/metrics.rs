//! Engine metrics.
//!
//! Counters and histograms complement the structured `tracing` events emitted
//! at operation boundaries.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Commit Metrics
// ============================================================================

/// Commit attempts counter.
pub const COMMIT_ATTEMPTS: &str = "tidal_commit_attempts_total";

/// Commit conflicts counter.
pub const COMMIT_CONFLICTS: &str = "tidal_commit_conflicts_total";

// ============================================================================
// Operation Metrics
// ============================================================================

/// Merge rows counter, labelled by outcome.
pub const MERGE_ROWS: &str = "tidal_merge_rows_total";

/// Vacuum deleted files counter.
pub const VACUUM_FILES_DELETED: &str = "tidal_vacuum_files_deleted_total";

/// Operation duration histogram, labelled by operation.
pub const OPERATION_DURATION: &str = "tidal_operation_duration_seconds";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all metric descriptions.
///
/// Call this once at application startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(COMMIT_ATTEMPTS, "Total log commit attempts");
    describe_counter!(COMMIT_CONFLICTS, "Total commit attempts lost to another writer");
    describe_counter!(MERGE_ROWS, "Rows processed by merge, by outcome");
    describe_counter!(VACUUM_FILES_DELETED, "Total data files deleted by vacuum");
    describe_histogram!(OPERATION_DURATION, "Duration of table operations in seconds");
}

// ============================================================================
// Recording
// ============================================================================

/// Records a commit attempt.
pub fn record_commit_attempt(operation: &'static str) {
    counter!(COMMIT_ATTEMPTS, "operation" => operation).increment(1);
}

/// Records a lost commit race.
pub fn record_commit_conflict(operation: &'static str) {
    counter!(COMMIT_CONFLICTS, "operation" => operation).increment(1);
}

/// Records merge row outcomes.
pub fn record_merge_rows(inserted: u64, updated: u64, deleted: u64, copied: u64) {
    counter!(MERGE_ROWS, "outcome" => "inserted").increment(inserted);
    counter!(MERGE_ROWS, "outcome" => "updated").increment(updated);
    counter!(MERGE_ROWS, "outcome" => "deleted").increment(deleted);
    counter!(MERGE_ROWS, "outcome" => "copied").increment(copied);
}

/// Records files removed by vacuum.
pub fn record_vacuum_deleted(files: u64) {
    counter!(VACUUM_FILES_DELETED).increment(files);
}

/// Records how long an operation took.
pub fn record_operation_duration(operation: &'static str, elapsed: Duration) {
    histogram!(OPERATION_DURATION, "operation" => operation).record(elapsed.as_secs_f64());
}
