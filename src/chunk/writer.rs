use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::storage::StorageBackend;
use crate::{Chunk, Result, StorageError};

pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub chunk_count: u64,
    pub byte_count: u64,
}

/// Splits an incoming byte stream into fixed-size chunks and persists them
/// in order.
///
/// Bytes that do not yet fill a chunk are carried over to the next
/// [`submit`](Self::submit); [`finish`](Self::finish) persists whatever is
/// left as a short final chunk and marks the file finished. Chunk writes
/// for one writer never overlap, so chunk numbers land in the store in
/// increasing order.
///
/// A writer that hit a store failure refuses further input: its carry-over
/// buffer is process-local, so the only safe recovery is a new file record.
pub struct ChunkWriter {
    store: Arc<dyn StorageBackend>,
    file_id: Uuid,
    chunk_size: usize,
    remainder: Vec<u8>,
    next_chunk: u64,
    bytes_persisted: u64,
    expected_size: Option<u64>,
    failed: bool,
}

impl ChunkWriter {
    pub fn new(store: Arc<dyn StorageBackend>, file_id: Uuid, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StorageError::InvalidMetadata(format!(
                "file {} has a chunk size of zero",
                file_id
            )));
        }
        Ok(Self {
            store,
            file_id,
            chunk_size,
            remainder: Vec::new(),
            next_chunk: 0,
            bytes_persisted: 0,
            expected_size: None,
            failed: false,
        })
    }

    /// Makes [`finish`](Self::finish) refuse to finalize unless exactly
    /// `size` bytes were submitted.
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Bytes submitted so far, persisted or carried over.
    pub fn bytes_submitted(&self) -> u64 {
        self.bytes_persisted + self.remainder.len() as u64
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn chunks_written(&self) -> u64 {
        self.next_chunk
    }

    /// Bytes held back because they do not fill a chunk yet.
    pub fn pending(&self) -> usize {
        self.remainder.len()
    }

    pub async fn submit(&mut self, buffer: &[u8]) -> Result<()> {
        self.ensure_live()?;

        let mut current = std::mem::take(&mut self.remainder);
        current.extend_from_slice(buffer);

        if current.len() < self.chunk_size {
            self.remainder = current;
            return Ok(());
        }

        // exact multiples yield only full slices, so nothing is carried over
        for slice in current.chunks(self.chunk_size) {
            if slice.len() < self.chunk_size {
                self.remainder = slice.to_vec();
                break;
            }
            self.persist(slice.to_vec()).await?;
        }
        Ok(())
    }

    /// Persists the carry-over, if any, then marks the file finished.
    pub async fn finish(mut self) -> Result<WriteSummary> {
        self.ensure_live()?;
        if let Some(expected) = self.expected_size {
            let actual = self.bytes_submitted();
            if actual != expected {
                return Err(StorageError::SizeMismatch {
                    file_id: self.file_id,
                    expected,
                    actual,
                });
            }
        }

        if !self.remainder.is_empty() {
            let tail = std::mem::take(&mut self.remainder);
            self.persist(tail).await?;
        }
        self.store.update_status(&self.file_id).await?;

        info!(
            "Finished file {} ({} chunks, {} bytes)",
            self.file_id, self.next_chunk, self.bytes_persisted
        );
        Ok(WriteSummary {
            chunk_count: self.next_chunk,
            byte_count: self.bytes_persisted,
        })
    }

    /// Feeds everything `reader` yields into the writer. Does not finish it.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.submit(&buffer[..n]).await?;
            total += n as u64;
        }
        Ok(total)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.failed {
            return Err(StorageError::WriterAborted(self.file_id));
        }
        Ok(())
    }

    async fn persist(&mut self, data: Vec<u8>) -> Result<()> {
        let chunk = Chunk::new(self.file_id, self.next_chunk, data);
        if let Err(e) = self.store.write_chunk(&chunk).await {
            self.failed = true;
            return Err(e);
        }
        debug!(
            file_id = %self.file_id,
            chunk_number = chunk.chunk_number,
            size = chunk.size(),
            "persisted chunk"
        );
        self.next_chunk += 1;
        self.bytes_persisted += chunk.size() as u64;
        Ok(())
    }
}
