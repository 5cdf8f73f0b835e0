//! # tidal-table
//!
//! Transactional, versioned tables over Parquet data files and an
//! object store.
//!
//! - **Transaction log**: one JSON entry per version, written with
//!   create-if-absent, plus periodic checkpoints
//! - **Snapshots**: table state at a version, the latest version, or a
//!   point in time
//! - **Commit protocol**: optimistic concurrency that re-plans an operation
//!   when another writer takes its version
//! - **Operations**: create, write (append/overwrite, schema evolution),
//!   merge, vacuum and compaction
//!
//! ## Example
//!
//! ```rust,no_run
//! use tidal_table::prelude::*;
//!
//! # async fn run(batch: arrow::record_batch::RecordBatch) -> tidal_table::Result<()> {
//! let table = TableBuilder::from_uri("memory://warehouse/orders").build()?;
//! let (table, written) = table
//!     .write([batch])
//!     .with_save_mode(SaveMode::Append)
//!     .execute()
//!     .await?;
//! assert_eq!(table.version(), Some(written.version));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod commit;
pub mod data_files;
pub mod error;
pub mod expr;
pub mod log;
pub mod metrics;
pub mod operations;
pub mod properties;
pub mod schema;
pub mod snapshot;
pub mod table;
pub mod value;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Result, TableError};
    pub use crate::operations::merge::{MemorySource, MergeMetrics, MergeSource, StreamSource};
    pub use crate::operations::optimize::OptimizeMetrics;
    pub use crate::operations::vacuum::VacuumMetrics;
    pub use crate::operations::write::{SaveMode, SchemaMode, WriteMetrics};
    pub use crate::schema::{DataType, Schema, StructField};
    pub use crate::snapshot::VersionSelector;
    pub use crate::table::{open_table, Table, TableBuilder};
}

pub use error::{Result, TableError};
pub use operations::merge::{
    DeleteBuilder, InsertBuilder, MemorySource, MergeBuilder, MergeClauses, MergeMetrics,
    MergeSource, StreamSource, UpdateBuilder,
};
pub use operations::optimize::{FileSizeStats, OptimizeBuilder, OptimizeMetrics};
pub use operations::vacuum::{VacuumBuilder, VacuumMetrics};
pub use operations::write::{SaveMode, SchemaMode, WriteBuilder, WriteMetrics};
pub use schema::{DataType, Schema, StructField};
pub use snapshot::{Snapshot, VersionSelector};
pub use table::{open_table, HistoryEntry, Table, TableBuilder};
pub use value::Value;
