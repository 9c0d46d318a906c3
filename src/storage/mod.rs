use async_trait::async_trait;
use uuid::Uuid;

use crate::{Chunk, FileFilter, FileMetadata, MetadataPatch, Result, UpsertPolicy};

pub mod memory;
pub mod sqlite;
pub mod validation;

/// One record per file, keyed by id.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Inserts `record`, or returns the existing record that `policy` says
    /// conflicts with it, unchanged.
    async fn upsert_metadata(
        &self,
        record: &FileMetadata,
        policy: UpsertPolicy,
    ) -> Result<FileMetadata>;

    /// Marks the file finished. Unknown ids are `NotFound`.
    async fn update_status(&self, file_id: &Uuid) -> Result<()>;

    /// Applies a sparse update; `None` when no record has `patch.id`.
    async fn update_fields(&self, patch: &MetadataPatch) -> Result<Option<FileMetadata>>;

    /// Matching records ordered by `file_date` ascending.
    async fn query_metadata(&self, filter: &FileFilter) -> Result<Vec<FileMetadata>>;
}

/// Chunk rows keyed by `(file_id, chunk_number)`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn write_chunk(&self, chunk: &Chunk) -> Result<()>;

    async fn read_chunk(&self, file_id: &Uuid, chunk_number: u64) -> Result<Option<Chunk>>;
}

#[async_trait]
pub trait StorageBackend: MetadataStore + ChunkStore {
    /// Releases the underlying connection. Safe to call more than once.
    async fn close(&self) {}
}
