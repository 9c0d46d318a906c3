mod metadata;
mod chunk;
mod file;

pub use chunk::Chunk;
pub use file::{ContentType, FileTypeDetector};
pub use metadata::{
    is_plain_component, Attributes, FileFilter, FileMetadata, FileStatus, MetadataPatch, NewFile,
    UpsertPolicy,
};
