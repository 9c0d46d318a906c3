use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::chunk::{ChunkReader, ChunkWriter, ContentDigest, WriteSummary, READ_BUFFER_SIZE};
use crate::storage::StorageBackend;
use crate::{FileMetadata, Result, StorageError};

/// A saved file's record together with the store its chunks live in.
#[derive(Clone)]
pub struct FileHandle {
    store: Arc<dyn StorageBackend>,
    metadata: FileMetadata,
}

impl FileHandle {
    pub fn new(store: Arc<dyn StorageBackend>, metadata: FileMetadata) -> Self {
        Self { store, metadata }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> FileMetadata {
        self.metadata
    }

    /// Sink for the file's content. A file that is already finished gets a
    /// sink that drops everything, so re-uploading deduplicated content
    /// writes no chunks. Otherwise the sink only finishes once exactly
    /// `file_size` bytes went in.
    pub fn write_stream(&self) -> Result<FileSink> {
        if self.metadata.is_finished() {
            debug!(file_id = %self.metadata.id, "file already finished, discarding writes");
            return Ok(FileSink::Discard);
        }
        let chunk_size = usize::try_from(self.metadata.file_chunk_size).map_err(|_| {
            StorageError::InvalidMetadata(format!(
                "chunk size {} is too large",
                self.metadata.file_chunk_size
            ))
        })?;
        let writer = ChunkWriter::new(self.store.clone(), self.metadata.id, chunk_size)?
            .with_expected_size(self.metadata.file_size);
        Ok(FileSink::Chunked(writer))
    }

    /// Writes everything `reader` yields as the file's content, hashing it on
    /// the way. The file is only finished when both the byte count and the
    /// checksum match the record; otherwise it stays `new`.
    pub async fn upload_from<R>(&self, reader: &mut R) -> Result<WriteSummary>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut sink = self.write_stream()?;
        if sink.is_inert() {
            sink.copy_from(reader).await?;
            return sink.finish().await;
        }

        let mut digest = ContentDigest::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            digest.update(&buffer[..n]);
            sink.submit(&buffer[..n]).await?;
        }

        let uploaded = digest.bytes();
        if uploaded != self.metadata.file_size {
            warn!(file_id = %self.metadata.id, uploaded, "upload ended at the wrong size");
            return Err(StorageError::SizeMismatch {
                file_id: self.metadata.id,
                expected: self.metadata.file_size,
                actual: uploaded,
            });
        }
        if let Err(e) = digest.verify(self.metadata.id, &self.metadata.file_checksum) {
            warn!(file_id = %self.metadata.id, "uploaded content does not match its checksum");
            return Err(e);
        }
        sink.finish().await
    }

    pub fn read_stream(&self) -> ChunkReader {
        ChunkReader::new(self.store.clone(), self.metadata.id, self.metadata.chunk_count())
    }

    pub async fn read_all(&self) -> Result<Vec<u8>> {
        self.read_stream().read_all().await
    }

    /// Streams the content into `writer` and checks it against the stored
    /// whole-file checksum. Returns the number of bytes written.
    pub async fn download_to<W>(&self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self.read_stream();
        let mut digest = ContentDigest::new();
        while let Some(data) = reader.next_chunk().await? {
            digest.update(&data);
            writer.write_all(&data).await?;
        }
        writer.flush().await?;

        let written = digest.bytes();
        digest.verify(self.metadata.id, &self.metadata.file_checksum)?;
        Ok(written)
    }
}

/// Where the bytes of an upload go.
pub enum FileSink {
    /// The content is already stored; input is accepted and dropped.
    Discard,
    Chunked(ChunkWriter),
}

impl FileSink {
    pub fn is_inert(&self) -> bool {
        matches!(self, FileSink::Discard)
    }

    pub async fn submit(&mut self, buffer: &[u8]) -> Result<()> {
        match self {
            FileSink::Discard => Ok(()),
            FileSink::Chunked(writer) => writer.submit(buffer).await,
        }
    }

    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match self {
            FileSink::Discard => Ok(tokio::io::copy(reader, &mut tokio::io::sink()).await?),
            FileSink::Chunked(writer) => writer.copy_from(reader).await,
        }
    }

    pub async fn finish(self) -> Result<WriteSummary> {
        match self {
            FileSink::Discard => Ok(WriteSummary::default()),
            FileSink::Chunked(writer) => writer.finish().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::MetadataStore;
    use crate::{FileFilter, FileStatus, NewFile, UpsertPolicy};
    use chrono::Utc;

    async fn handle_for(store: &Arc<MemoryStore>, content: &[u8]) -> FileHandle {
        let record = NewFile::for_content("h.bin", content).into_record(4, Utc::now());
        let stored = store
            .upsert_metadata(&record, UpsertPolicy::ByChecksum)
            .await
            .unwrap();
        FileHandle::new(store.clone(), stored)
    }

    #[tokio::test]
    async fn test_write_then_download() {
        let store = Arc::new(MemoryStore::new());
        let handle = handle_for(&store, b"ABCDEFGHI").await;

        let mut sink = handle.write_stream().unwrap();
        assert!(!sink.is_inert());
        sink.submit(b"ABCDEFGHI").await.unwrap();
        let summary = sink.finish().await.unwrap();
        assert_eq!(summary.chunk_count, 3);

        let mut out = Vec::new();
        assert_eq!(handle.download_to(&mut out).await.unwrap(), 9);
        assert_eq!(out, b"ABCDEFGHI");
    }

    #[tokio::test]
    async fn test_finished_file_gets_inert_sink() {
        let store = Arc::new(MemoryStore::new());
        let handle = handle_for(&store, b"ABCDE").await;
        let mut sink = handle.write_stream().unwrap();
        sink.submit(b"ABCDE").await.unwrap();
        sink.finish().await.unwrap();
        let writes = store.chunk_writes().await;

        let again = handle_for(&store, b"ABCDE").await;
        assert!(again.metadata().is_finished());
        let mut sink = again.write_stream().unwrap();
        assert!(sink.is_inert());
        sink.submit(b"ABCDE").await.unwrap();
        let mut input: &[u8] = b"more";
        assert_eq!(sink.copy_from(&mut input).await.unwrap(), 4);
        assert_eq!(sink.finish().await.unwrap(), WriteSummary::default());
        assert_eq!(store.chunk_writes().await, writes);
    }

    #[tokio::test]
    async fn test_download_detects_wrong_content() {
        let store = Arc::new(MemoryStore::new());
        let handle = handle_for(&store, b"ABCDEFGHI").await;
        let mut sink = handle.write_stream().unwrap();
        sink.submit(b"ABCDEFGHX").await.unwrap();
        sink.finish().await.unwrap();

        let mut out = Vec::new();
        let err = handle.download_to(&mut out).await.unwrap_err();
        assert!(matches!(err, StorageError::IntegrityMismatch { .. }));
    }

    async fn status_of(store: &Arc<MemoryStore>, handle: &FileHandle) -> FileStatus {
        let filter = FileFilter::new().with_id(handle.metadata().id);
        store.query_metadata(&filter).await.unwrap()[0].status
    }

    #[tokio::test]
    async fn test_upload_from_finishes_matching_content() {
        let store = Arc::new(MemoryStore::new());
        let handle = handle_for(&store, b"ABCDEFGHI").await;
        let mut input: &[u8] = b"ABCDEFGHI";
        let summary = handle.upload_from(&mut input).await.unwrap();
        assert_eq!(summary, WriteSummary { chunk_count: 3, byte_count: 9 });
        assert_eq!(status_of(&store, &handle).await, FileStatus::Finished);
    }

    #[tokio::test]
    async fn test_upload_from_rejects_changed_content() {
        let store = Arc::new(MemoryStore::new());
        let handle = handle_for(&store, b"ABCDEFGHI").await;
        let mut input: &[u8] = b"ABCDEFGHX";
        let err = handle.upload_from(&mut input).await.unwrap_err();
        assert!(matches!(err, StorageError::IntegrityMismatch { .. }));
        assert_eq!(status_of(&store, &handle).await, FileStatus::New);
    }

    #[tokio::test]
    async fn test_upload_from_rejects_truncated_content() {
        let store = Arc::new(MemoryStore::new());
        let handle = handle_for(&store, b"ABCDEFGHI").await;
        let mut input: &[u8] = b"ABCDE";
        let err = handle.upload_from(&mut input).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::SizeMismatch { expected: 9, actual: 5, .. }
        ));
        assert_eq!(status_of(&store, &handle).await, FileStatus::New);
    }

    #[tokio::test]
    async fn test_short_sink_does_not_finish() {
        let store = Arc::new(MemoryStore::new());
        let handle = handle_for(&store, b"ABCDEFGHI").await;
        let mut sink = handle.write_stream().unwrap();
        sink.submit(b"ABCD").await.unwrap();
        let err = sink.finish().await.unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { .. }));
        assert_eq!(status_of(&store, &handle).await, FileStatus::New);
    }
}
