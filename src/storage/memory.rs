use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChunkStore, MetadataStore, StorageBackend};
use crate::{
    Chunk, FileFilter, FileMetadata, FileStatus, MetadataPatch, Result, StorageError, UpsertPolicy,
};

#[derive(Default)]
struct MemoryState {
    // insertion order doubles as the tie-breaker for equal file dates
    files: Vec<FileMetadata>,
    chunks: BTreeMap<(Uuid, u64), Chunk>,
    chunk_writes: u64,
}

impl MemoryState {
    fn find(&self, id: &Uuid) -> Option<&FileMetadata> {
        self.files.iter().find(|f| &f.id == id)
    }

    fn insert(&mut self, record: &FileMetadata) -> Result<FileMetadata> {
        if self.find(&record.id).is_some() {
            return Err(StorageError::Storage(format!("file {} already exists", record.id)));
        }
        self.files.push(record.clone());
        Ok(record.clone())
    }
}

/// Keeps files and chunks in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunk rows accepted so far, across all files.
    pub async fn chunk_writes(&self) -> u64 {
        self.state.lock().await.chunk_writes
    }

    /// Stored chunks of one file in chunk-number order.
    pub async fn chunks(&self, file_id: &Uuid) -> Vec<Chunk> {
        let state = self.state.lock().await;
        state
            .chunks
            .range((*file_id, 0)..=(*file_id, u64::MAX))
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn upsert_metadata(
        &self,
        record: &FileMetadata,
        policy: UpsertPolicy,
    ) -> Result<FileMetadata> {
        let mut state = self.state.lock().await;
        let existing = match policy {
            UpsertPolicy::ByChecksum => state
                .files
                .iter()
                .find(|f| f.file_checksum == record.file_checksum),
            UpsertPolicy::ById => state.find(&record.id),
            UpsertPolicy::AlwaysInsert => None,
        }
        .cloned();

        match existing {
            Some(found) => Ok(found),
            None => state.insert(record),
        }
    }

    async fn update_status(&self, file_id: &Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .files
            .iter_mut()
            .find(|f| &f.id == file_id)
            .ok_or_else(|| StorageError::NotFound(file_id.to_string()))?;
        record.status = FileStatus::Finished;
        Ok(())
    }

    async fn update_fields(&self, patch: &MetadataPatch) -> Result<Option<FileMetadata>> {
        let mut state = self.state.lock().await;
        Ok(state.files.iter_mut().find(|f| f.id == patch.id).map(|record| {
            patch.apply(record);
            record.clone()
        }))
    }

    async fn query_metadata(&self, filter: &FileFilter) -> Result<Vec<FileMetadata>> {
        let state = self.state.lock().await;
        let mut matching: Vec<FileMetadata> = state
            .files
            .iter()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect();
        matching.sort_by_key(|f| f.file_date);
        Ok(matching)
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn write_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.find(&chunk.file_id).is_none() {
            return Err(StorageError::NotFound(chunk.file_id.to_string()));
        }
        let key = (chunk.file_id, chunk.chunk_number);
        if state.chunks.contains_key(&key) {
            return Err(StorageError::Storage(format!(
                "chunk {} of file {} already exists",
                chunk.chunk_number, chunk.file_id
            )));
        }
        state.chunks.insert(key, chunk.clone());
        state.chunk_writes += 1;
        Ok(())
    }

    async fn read_chunk(&self, file_id: &Uuid, chunk_number: u64) -> Result<Option<Chunk>> {
        let state = self.state.lock().await;
        Ok(state.chunks.get(&(*file_id, chunk_number)).cloned())
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {}
