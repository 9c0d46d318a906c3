use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Chunk {chunk_number} of file {file_id} is missing")]
    MissingChunk { file_id: Uuid, chunk_number: u64 },
    #[error("Chunk {chunk_number} of file {file_id} is corrupt: {reason}")]
    CorruptChunk {
        file_id: Uuid,
        chunk_number: u64,
        reason: String,
    },
    #[error("Checksum mismatch for file {file_id}. Expected: {expected}, Got: {actual}")]
    IntegrityMismatch {
        file_id: Uuid,
        expected: String,
        actual: String,
    },
    #[error("File {file_id} expects {expected} bytes but {actual} were written")]
    SizeMismatch {
        file_id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Writer for file {0} already failed and cannot continue")]
    WriterAborted(Uuid),
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
