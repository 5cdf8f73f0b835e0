//! Error types for `tidal-table`.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Table-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// A predicate or expression failed to parse or bind.
    #[error("invalid predicate `{expression}`: {message}")]
    InvalidPredicate {
        /// The offending expression text.
        expression: String,
        /// What was wrong with it.
        message: String,
    },

    /// Data or a requested schema change is incompatible with the table schema.
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        /// Human-readable mismatch details.
        message: String,
    },

    /// A merge was executed without any clause.
    #[error("merge requires at least one when_matched / when_not_matched clause")]
    NoClausesSpecified,

    /// A merge clause variant is accepted by the builder but not executable.
    #[error("merge clause `{clause}` is not supported")]
    UnsupportedClauseVariant {
        /// The builder method that produced the clause.
        clause: &'static str,
    },

    /// Commit attempts were exhausted by concurrent writers.
    #[error("gave up committing after {attempts} attempts due to concurrent modifications")]
    ConcurrentModificationExceeded {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A requested version or timestamp is outside the retained log.
    #[error("version not found: {message}")]
    VersionNotFound {
        /// What was requested and what is available.
        message: String,
    },

    /// No transaction log exists at the location.
    #[error("no table found at {location}")]
    TableNotFound {
        /// The table location.
        location: String,
    },

    /// A table already exists at the location.
    #[error("table already exists at {location}")]
    TableAlreadyExists {
        /// The table location.
        location: String,
    },

    /// A target row matched more than one source row and would be modified.
    #[error("multiple source rows matched target row in file {path}; merge is ambiguous")]
    MultipleSourceRowsMatched {
        /// Data file holding the ambiguous target row.
        path: String,
    },

    /// Vacuum retention is shorter than the table minimum.
    #[error(
        "vacuum retention of {requested_hours}h is below the table minimum of {minimum_hours}h; \
         disable enforce_retention_duration to override"
    )]
    RetentionTooShort {
        /// Requested retention.
        requested_hours: i64,
        /// Table minimum retention.
        minimum_hours: i64,
    },

    /// Invalid input or an invariant violation in requested actions.
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable details.
        message: String,
    },

    /// An expression failed at evaluation time.
    #[error("evaluation error: {message}")]
    Evaluation {
        /// Human-readable details.
        message: String,
    },

    /// Failed to serialize or deserialize log state.
    #[error("serialization error: {message}")]
    Serialization {
        /// Human-readable details.
        message: String,
    },

    /// Parquet encoding or decoding failed.
    #[error("parquet error: {message}")]
    Parquet {
        /// Human-readable details.
        message: String,
    },

    /// An Arrow compute or conversion failed.
    #[error("arrow error: {message}")]
    Arrow {
        /// Human-readable details.
        message: String,
    },

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] tidal_core::Error),
}

impl TableError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a schema mismatch error.
    #[must_use]
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Creates an invalid predicate error.
    #[must_use]
    pub fn invalid_predicate(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPredicate {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Creates a version not found error.
    #[must_use]
    pub fn version_not_found(message: impl Into<String>) -> Self {
        Self::VersionNotFound {
            message: message.into(),
        }
    }

    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

impl From<ArrowError> for TableError {
    fn from(value: ArrowError) -> Self {
        Self::Arrow {
            message: value.to_string(),
        }
    }
}

impl From<ParquetError> for TableError {
    fn from(value: ParquetError) -> Self {
        Self::Parquet {
            message: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for TableError {
    fn from(value: serde_json::Error) -> Self {
        Self::serialization(value.to_string())
    }
}
