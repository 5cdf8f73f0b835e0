//! Table operations. Each is a builder consumed by `execute()`.

pub mod create;
pub mod merge;
pub mod optimize;
pub mod vacuum;
pub mod write;
