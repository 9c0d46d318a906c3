use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::handle::FileHandle;
use crate::storage::validation::ValidationManager;
use crate::storage::StorageBackend;
use crate::{FileFilter, FileMetadata, FileStatus, MetadataPatch, NewFile, Result, StorageError};

/// Entry point for finding, saving and updating files.
pub struct Catalog {
    store: Arc<dyn StorageBackend>,
    chunk_size: u64,
}

impl Catalog {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE as u64,
        }
    }

    /// Chunk size stamped on files saved from now on.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StorageError::InvalidMetadata(
                "chunk size must be greater than zero".into(),
            ));
        }
        self.chunk_size = chunk_size as u64;
        Ok(self)
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn store(&self) -> Arc<dyn StorageBackend> {
        self.store.clone()
    }

    pub fn validator(&self) -> ValidationManager {
        ValidationManager::new(self.store.clone())
    }

    /// Handles for every record matching `filter`, oldest `file_date` first.
    pub async fn list(&self, filter: FileFilter) -> Result<Vec<FileHandle>> {
        let filter = filter.normalized();
        let records = self.store.query_metadata(&filter).await?;
        debug!("Listed {} file(s)", records.len());
        Ok(records
            .into_iter()
            .map(|record| FileHandle::new(self.store.clone(), record))
            .collect())
    }

    /// Stores the draft's record, or returns the one it deduplicates to.
    ///
    /// The returned handle's record may already be `finished`, in which case
    /// its [`write_stream`](FileHandle::write_stream) discards input.
    pub async fn save(&self, draft: NewFile) -> Result<FileHandle> {
        draft.validate()?;
        let policy = draft.policy();
        let record = draft.into_record(self.chunk_size, Utc::now());
        let stored = self.store.upsert_metadata(&record, policy).await?;

        match SaveOutcome::of(&record, &stored) {
            SaveOutcome::Inserted => {
                info!("Saved {} as {} ({:?})", stored.generated_name, stored.id, policy)
            }
            SaveOutcome::Reused => info!(
                "Content of {} already stored as {}",
                record.generated_name, stored.id
            ),
            // a second writer on this record would collide on chunk numbers
            SaveOutcome::ReusedUnfinished => warn!(
                "Content of {} matches unfinished upload {}; its chunks may already exist",
                record.generated_name, stored.id
            ),
        }
        Ok(FileHandle::new(self.store.clone(), stored))
    }

    /// Applies a sparse update; `None` when the id is unknown.
    pub async fn update(&self, patch: MetadataPatch) -> Result<Option<FileMetadata>> {
        let patch = patch.normalized()?;
        let updated = self.store.update_fields(&patch).await?;
        match &updated {
            Some(record) => info!("Updated file {}", record.id),
            None => debug!("No file {} to update", patch.id),
        }
        Ok(updated)
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveOutcome {
    Inserted,
    Reused,
    ReusedUnfinished,
}

impl SaveOutcome {
    fn of(record: &FileMetadata, stored: &FileMetadata) -> Self {
        if stored.id == record.id {
            SaveOutcome::Inserted
        } else if stored.status == FileStatus::New {
            SaveOutcome::ReusedUnfinished
        } else {
            SaveOutcome::Reused
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyGroup {
    /// Segments joined with `/`; empty for files without a hierarchy.
    pub hierarchy: String,
    pub count: usize,
    pub total_bytes: u64,
}

/// Groups files by hierarchy in the order each hierarchy first appears.
pub fn group_by_hierarchy(files: &[FileHandle]) -> Vec<HierarchyGroup> {
    let mut groups: Vec<HierarchyGroup> = Vec::new();
    for file in files {
        let metadata = file.metadata();
        let hierarchy = metadata.hierarchy_path();
        match groups.iter_mut().find(|g| g.hierarchy == hierarchy) {
            Some(group) => {
                group.count += 1;
                group.total_bytes += metadata.file_size;
            }
            None => groups.push(HierarchyGroup {
                hierarchy,
                count: 1,
                total_bytes: metadata.file_size,
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use uuid::Uuid;

    fn catalog() -> (Arc<MemoryStore>, Catalog) {
        let store = Arc::new(MemoryStore::new());
        let catalog = Catalog::new(store.clone()).with_chunk_size(4).unwrap();
        (store, catalog)
    }

    #[tokio::test]
    async fn test_save_stamps_new_record() {
        let (_, catalog) = catalog();
        let handle = catalog
            .save(NewFile::for_content("a.txt", b"hello"))
            .await
            .unwrap();
        let metadata = handle.metadata();
        assert_eq!(metadata.status, FileStatus::New);
        assert_eq!(metadata.file_chunk_size, 4);
        assert_eq!(metadata.file_size, 5);
    }

    #[tokio::test]
    async fn test_save_rejects_bad_draft() {
        let (_, catalog) = catalog();
        let err = catalog.save(NewFile::new("", 1, "ab".repeat(32))).await;
        assert!(matches!(err, Err(StorageError::InvalidMetadata(_))));
        assert!(Catalog::new(Arc::new(MemoryStore::new())).with_chunk_size(0).is_err());
    }

    #[tokio::test]
    async fn test_second_save_of_finished_content_writes_nothing() {
        let (store, catalog) = catalog();
        let first = catalog.save(NewFile::for_content("a.txt", b"ABCDEFGHI")).await.unwrap();
        let mut sink = first.write_stream().unwrap();
        sink.submit(b"ABCDEFGHI").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(store.chunk_writes().await, 3);

        let second = catalog.save(NewFile::for_content("b.txt", b"ABCDEFGHI")).await.unwrap();
        assert_eq!(second.metadata().id, first.metadata().id);
        assert!(second.write_stream().unwrap().is_inert());
        assert_eq!(store.chunk_writes().await, 3);
    }

    #[tokio::test]
    async fn test_save_over_unfinished_upload_reuses_record() {
        let (store, catalog) = catalog();
        let first = catalog.save(NewFile::for_content("a.txt", b"ABCDEFGHI")).await.unwrap();
        let mut sink = first.write_stream().unwrap();
        sink.submit(b"ABCD").await.unwrap();
        drop(sink);

        let draft = NewFile::for_content("b.txt", b"ABCDEFGHI");
        let record = draft.clone().into_record(4, Utc::now());
        let second = catalog.save(draft).await.unwrap();
        assert_eq!(second.metadata().id, first.metadata().id);
        assert_eq!(second.metadata().status, FileStatus::New);
        assert_eq!(
            SaveOutcome::of(&record, second.metadata()),
            SaveOutcome::ReusedUnfinished
        );
        assert_eq!(store.chunk_writes().await, 1);
    }

    #[test]
    fn test_save_outcome_classification() {
        let record = NewFile::for_content("a.txt", b"abc").into_record(4, Utc::now());
        assert_eq!(SaveOutcome::of(&record, &record), SaveOutcome::Inserted);

        let mut other = NewFile::for_content("b.txt", b"abc").into_record(4, Utc::now());
        assert_eq!(SaveOutcome::of(&record, &other), SaveOutcome::ReusedUnfinished);
        other.status = FileStatus::Finished;
        assert_eq!(SaveOutcome::of(&record, &other), SaveOutcome::Reused);
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let (_, catalog) = catalog();
        let mut patch = MetadataPatch::new(Uuid::new_v4());
        patch.generated_name = Some("x".into());
        assert!(catalog.update(patch).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_grouping_keeps_first_seen_order() {
        let (_, catalog) = catalog();
        for (name, content, hierarchy) in [
            ("a", &b"1"[..], vec!["docs"]),
            ("b", &b"22"[..], vec!["img", "2020"]),
            ("c", &b"333"[..], vec!["docs"]),
            ("d", &b"4444"[..], vec![]),
        ] {
            catalog
                .save(NewFile::for_content(name, content).with_hierarchy(hierarchy))
                .await
                .unwrap();
        }
        let files = catalog.list(FileFilter::new()).await.unwrap();
        let groups = group_by_hierarchy(&files);
        assert_eq!(
            groups,
            vec![
                HierarchyGroup { hierarchy: "docs".into(), count: 2, total_bytes: 4 },
                HierarchyGroup { hierarchy: "img/2020".into(), count: 1, total_bytes: 2 },
                HierarchyGroup { hierarchy: String::new(), count: 1, total_bytes: 4 },
            ]
        );
    }
}
