//! # tidal-core
//!
//! Core abstractions shared by every Tidal component:
//!
//! - **Storage Contract**: the object-store trait with conditional writes
//! - **Backends**: in-memory and local filesystem implementations
//! - **Storage Registry**: URI scheme to backend resolution
//! - **Table Storage**: a backend scoped to one table root
//! - **Configuration**: engine tuning knobs with environment overrides
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use tidal_core::prelude::*;
//!
//! let registry = StorageRegistry::with_defaults();
//! let storage = registry
//!     .resolve("memory://warehouse/orders", &StorageOptions::new())
//!     .expect("memory scheme is registered");
//! assert_eq!(storage.uri(), "memory://warehouse/orders");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod error;
pub mod local;
pub mod observability;
pub mod registry;
pub mod storage;
pub mod table_storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::local::LocalFsBackend;
    pub use crate::registry::{BackendFactory, StorageOptions, StorageRegistry};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
    pub use crate::table_storage::TableStorage;
}

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use local::LocalFsBackend;
pub use observability::{init_logging, LogFormat};
pub use registry::{BackendFactory, StorageOptions, StorageRegistry};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
pub use table_storage::TableStorage;
