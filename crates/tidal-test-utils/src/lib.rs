//! Shared test utilities for Tidal integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: in-memory storage with call recording and
//!   failure injection
//! - [`TestTable`]: a table location whose handles share one backend
//! - Batch builders and a [`SimulatedClock`] for vacuum
//!
//! # Example
//!
//! ```rust,ignore
//! use tidal_test_utils::{table_xy, TestTable};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let location = TestTable::new();
//!     let table = location.create_xy(&[1, 2], &[Some(3), None]).await;
//!     assert_eq!(table_xy(&table).await, vec![(1, Some(3)), (2, None)]);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// panics are the failure mode of test helpers
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (safe to call from every test).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tidal_core=debug".parse().expect("valid directive"))
                .add_directive("tidal_table=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

/// Asserts that none of the recorded calls could have changed the store.
///
/// # Panics
///
/// Panics listing the offending calls.
pub fn assert_no_mutations(backend: &TracingMemoryBackend) {
    let mutations = backend.mutations();
    assert!(mutations.is_empty(), "unexpected storage mutations: {mutations:?}");
}
