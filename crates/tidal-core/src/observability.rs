//! Logging initialization and span helpers.
//!
//! Table operations log with structured fields and a `metric` field naming
//! the event, e.g. `metric = "tidal_commit_conflict"`, so log pipelines can
//! aggregate them without parsing messages.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs.
    Json,
    /// Human-readable logs.
    #[default]
    Pretty,
}

/// Initializes the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` controls levels (e.g. `info`, `tidal_table=debug`); the
/// default is `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        if result.is_err() {
            tracing::debug!("global subscriber already installed");
        }
    });
}

/// Creates a span for a table operation.
///
/// ```rust
/// use tidal_core::observability::table_span;
///
/// let span = table_span("merge", "memory://wh/orders");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn table_span(operation: &str, table_uri: &str) -> Span {
    tracing::info_span!("table", op = operation, table = table_uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_table_span_enters() {
        let span = table_span("vacuum", "memory://wh/t");
        let _guard = span.enter();
        tracing::info!("inside table span");
    }
}
