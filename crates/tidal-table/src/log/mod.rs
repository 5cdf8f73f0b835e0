//! The transaction log: ordered commit entries, checkpoints, cleanup.

mod actions;
mod checkpoint;
mod store;

pub use actions::{
    decode_entry, encode_entry, Action, AddFile, CommitInfo, FileStats, Metadata,
    PartitionValues, RemoveFile, ENGINE_INFO,
};
pub use checkpoint::Checkpoint;
pub use store::{checkpoint_path, entry_path, LogFile, LogListing, LogStore, LOG_DIR};
