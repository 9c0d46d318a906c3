use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Result, StorageError};

mod reader;
mod writer;

pub use reader::ChunkReader;
pub(crate) use writer::READ_BUFFER_SIZE;
pub use writer::{ChunkWriter, WriteSummary};

/// Hex encoded SHA-256 of `data`. Used for both chunk and whole-file digests.
pub fn calculate_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whole-content digest built up one buffer at a time.
#[derive(Clone, Default)]
pub struct ContentDigest {
    hasher: Sha256,
    bytes: u64,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    /// Fails with `IntegrityMismatch` unless the digest equals `expected`.
    pub fn verify(self, file_id: Uuid, expected: &str) -> Result<()> {
        let actual = self.finalize();
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(StorageError::IntegrityMismatch {
                file_id,
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}
