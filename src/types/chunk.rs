use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted slice of a file, keyed by `(file_id, chunk_number)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub file_id: Uuid,
    pub chunk_number: u64,
    pub checksum: String,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(file_id: Uuid, chunk_number: u64, data: Vec<u8>) -> Self {
        let checksum = crate::chunk::calculate_checksum(&data);
        Self {
            file_id,
            chunk_number,
            checksum,
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
