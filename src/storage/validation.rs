use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::StorageBackend;
use crate::chunk::{calculate_checksum, ContentDigest};
use crate::{FileMetadata, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkProblem {
    Missing,
    /// The stored bytes don't hash to the stored chunk checksum.
    Corrupt,
    WrongLength { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIssue {
    pub chunk_number: u64,
    pub problem: ChunkProblem,
}

/// Outcome of checking one file's chunks against its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub file_id: Uuid,
    pub chunks_checked: u64,
    pub bytes_checked: u64,
    pub issues: Vec<ChunkIssue>,
    /// Whole-file digest, present only when every chunk could be read.
    pub computed_checksum: Option<String>,
    pub checksum_matches: bool,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty() && self.checksum_matches
    }
}

/// Re-reads a finished file's chunks and checks them against its metadata.
pub struct ValidationManager {
    store: Arc<dyn StorageBackend>,
}

impl ValidationManager {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self { store }
    }

    /// Content problems land in the report. Only store failures are errors.
    pub async fn validate_file(&self, metadata: &FileMetadata) -> Result<ValidationReport> {
        let chunk_count = metadata.chunk_count();
        let mut digest = ContentDigest::new();
        let mut issues = Vec::new();
        let mut chunks_checked = 0;

        for chunk_number in 0..chunk_count {
            let Some(chunk) = self.store.read_chunk(&metadata.id, chunk_number).await? else {
                issues.push(ChunkIssue {
                    chunk_number,
                    problem: ChunkProblem::Missing,
                });
                continue;
            };
            chunks_checked += 1;

            let expected = expected_length(metadata, chunk_number);
            let actual = chunk.size() as u64;
            if actual != expected {
                issues.push(ChunkIssue {
                    chunk_number,
                    problem: ChunkProblem::WrongLength { expected, actual },
                });
            }
            if !calculate_checksum(&chunk.data).eq_ignore_ascii_case(&chunk.checksum) {
                issues.push(ChunkIssue {
                    chunk_number,
                    problem: ChunkProblem::Corrupt,
                });
            }
            digest.update(&chunk.data);
        }

        let bytes_checked = digest.bytes();
        let all_present = chunks_checked == chunk_count;
        let computed_checksum = all_present.then(|| digest.finalize());
        let checksum_matches = computed_checksum
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(&metadata.file_checksum));

        let report = ValidationReport {
            file_id: metadata.id,
            chunks_checked,
            bytes_checked,
            issues,
            computed_checksum,
            checksum_matches,
        };
        if report.is_valid() {
            info!("File {} verified ({} chunks)", metadata.id, chunk_count);
        } else {
            warn!(
                "File {} failed verification with {} chunk issue(s)",
                metadata.id,
                report.issues.len()
            );
        }
        Ok(report)
    }
}

// Every chunk is full except the last, which holds what is left.
fn expected_length(metadata: &FileMetadata, chunk_number: u64) -> u64 {
    let start = chunk_number * metadata.file_chunk_size;
    metadata.file_chunk_size.min(metadata.file_size.saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::{ChunkStore, MetadataStore};
    use crate::{Chunk, NewFile, UpsertPolicy};
    use chrono::Utc;

    async fn stored(content: &[u8], chunks: &[&[u8]]) -> (Arc<MemoryStore>, FileMetadata) {
        let store = Arc::new(MemoryStore::new());
        let record = NewFile::for_content("v.bin", content).into_record(4, Utc::now());
        let record = store
            .upsert_metadata(&record, UpsertPolicy::AlwaysInsert)
            .await
            .unwrap();
        for (i, data) in chunks.iter().enumerate() {
            store
                .write_chunk(&Chunk::new(record.id, i as u64, data.to_vec()))
                .await
                .unwrap();
        }
        (store, record)
    }

    #[tokio::test]
    async fn test_intact_file_is_valid() {
        let (store, record) = stored(b"ABCDEFGHI", &[b"ABCD", b"EFGH", b"I"]).await;
        let report = ValidationManager::new(store).validate_file(&record).await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.chunks_checked, 3);
        assert_eq!(report.bytes_checked, 9);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_reported() {
        let (store, record) = stored(b"ABCDEFGHI", &[b"ABCD", b"EFGH"]).await;
        let report = ValidationManager::new(store).validate_file(&record).await.unwrap();
        assert!(!report.is_valid());
        assert_eq!(
            report.issues,
            vec![ChunkIssue {
                chunk_number: 2,
                problem: ChunkProblem::Missing
            }]
        );
        assert!(report.computed_checksum.is_none());
    }

    #[tokio::test]
    async fn test_wrong_partition_is_reported() {
        let (store, record) = stored(b"ABCDEFGHI", &[b"ABC", b"DEFG", b"HI"]).await;
        let report = ValidationManager::new(store).validate_file(&record).await.unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| i.problem == ChunkProblem::WrongLength { expected: 4, actual: 3 }));
        // the bytes still concatenate to the right content
        assert!(report.checksum_matches);
        assert!(!report.is_valid());
    }

    #[tokio::test]
    async fn test_content_mismatch_is_reported() {
        let (store, record) = stored(b"ABCDEFGHI", &[b"ABCD", b"EFGH", b"X"]).await;
        let report = ValidationManager::new(store).validate_file(&record).await.unwrap();
        assert!(report.issues.is_empty());
        assert!(!report.checksum_matches);
    }
}
