pub mod catalog;
pub mod chunk;
pub mod config;
pub mod error;
pub mod handle;
pub mod storage;

mod types;

pub use catalog::{group_by_hierarchy, Catalog, HierarchyGroup};
pub use chunk::{calculate_checksum, ChunkReader, ChunkWriter, ContentDigest, WriteSummary};
pub use config::StoreConfig;
pub use error::{Result, StorageError};
pub use handle::{FileHandle, FileSink};
pub use types::*;
