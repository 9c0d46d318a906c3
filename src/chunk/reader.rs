use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::calculate_checksum;
use crate::storage::StorageBackend;
use crate::{Result, StorageError};

/// Pulls a file's chunks from the store one at a time, in order.
///
/// Nothing is fetched until the caller asks for the next chunk. The reader
/// is single-use: once it reports the end, or any error, it stays done.
pub struct ChunkReader {
    store: Arc<dyn StorageBackend>,
    file_id: Uuid,
    chunk_count: u64,
    index: u64,
    done: bool,
}

impl ChunkReader {
    pub fn new(store: Arc<dyn StorageBackend>, file_id: Uuid, chunk_count: u64) -> Self {
        Self {
            store,
            file_id,
            chunk_count,
            index: 0,
            done: false,
        }
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Next chunk's bytes, `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done || self.index >= self.chunk_count {
            self.done = true;
            return Ok(None);
        }

        let chunk_number = self.index;
        self.index += 1;

        match self.fetch(chunk_number).await {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    async fn fetch(&self, chunk_number: u64) -> Result<Vec<u8>> {
        let chunk = self
            .store
            .read_chunk(&self.file_id, chunk_number)
            .await?
            .ok_or_else(|| {
                warn!("Chunk {} of file {} is missing", chunk_number, self.file_id);
                StorageError::MissingChunk {
                    file_id: self.file_id,
                    chunk_number,
                }
            })?;

        let actual = calculate_checksum(&chunk.data);
        if !actual.eq_ignore_ascii_case(&chunk.checksum) {
            warn!("Chunk {} of file {} failed its checksum", chunk_number, self.file_id);
            return Err(StorageError::CorruptChunk {
                file_id: self.file_id,
                chunk_number,
                reason: format!("stored checksum {}, computed {}", chunk.checksum, actual),
            });
        }

        debug!(file_id = %self.file_id, chunk_number, size = chunk.data.len(), "fetched chunk");
        Ok(chunk.data)
    }

    /// The reader as a `Stream` of chunk buffers. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        stream::try_unfold(self, |mut reader| async move {
            Ok::<_, StorageError>(reader.next_chunk().await?.map(|data| (data, reader)))
        })
    }

    /// Writes every chunk to `writer` as it arrives, returning the byte count.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total = 0u64;
        while let Some(data) = self.next_chunk().await? {
            writer.write_all(&data).await?;
            total += data.len() as u64;
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Collects the whole file in memory.
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}
