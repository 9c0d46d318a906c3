use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StorageError};

/// Free-form key/value bag carried alongside a file.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    New,
    Finished,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(FileStatus::New),
            "finished" => Ok(FileStatus::Finished),
            other => Err(StorageError::InvalidMetadata(format!("unknown file status '{}'", other))),
        }
    }
}

/// The stored record for one logical file.
///
/// `status == Finished` means chunks `0..chunk_count()` are all persisted,
/// every one of them `file_chunk_size` long except possibly the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: Uuid,
    pub file_date: DateTime<Utc>,
    pub record_date: DateTime<Utc>,
    pub original_name: String,
    pub generated_name: String,
    pub mime_type: Option<String>,
    pub file_extension: Option<String>,
    pub file_source: Option<String>,
    pub file_hierarchy: Vec<String>,
    pub file_size: u64,
    pub file_checksum: String,
    pub file_chunk_size: u64,
    pub attributes: Attributes,
    pub status: FileStatus,
}

impl FileMetadata {
    /// Number of chunks a complete copy of this file occupies.
    pub fn chunk_count(&self) -> u64 {
        if self.file_chunk_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.file_chunk_size)
    }

    pub fn is_finished(&self) -> bool {
        self.status == FileStatus::Finished
    }

    /// Hierarchy segments joined as a path, used for grouping and display.
    pub fn hierarchy_path(&self) -> String {
        self.file_hierarchy.join("/")
    }
}

/// Which conflict key a save resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertPolicy {
    /// Reuse any existing record with the same content checksum.
    ByChecksum,
    /// Reuse an existing record with the same caller-assigned id.
    ById,
    /// Always create a fresh record.
    AlwaysInsert,
}

impl UpsertPolicy {
    pub fn resolve(deduplicate: bool, id: Option<&Uuid>) -> Self {
        match (deduplicate, id) {
            (true, _) => UpsertPolicy::ByChecksum,
            (false, Some(_)) => UpsertPolicy::ById,
            (false, None) => UpsertPolicy::AlwaysInsert,
        }
    }
}

/// A save request. Deduplication is on unless switched off.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub id: Option<Uuid>,
    pub deduplicate: bool,
    pub file_date: DateTime<Utc>,
    pub original_name: String,
    pub generated_name: String,
    pub mime_type: Option<String>,
    pub file_extension: Option<String>,
    pub file_source: Option<String>,
    pub file_hierarchy: Vec<String>,
    pub file_size: u64,
    pub file_checksum: String,
    pub attributes: Attributes,
}

impl NewFile {
    pub fn new(
        generated_name: impl Into<String>,
        file_size: u64,
        file_checksum: impl Into<String>,
    ) -> Self {
        let generated_name = generated_name.into();
        Self {
            id: None,
            deduplicate: true,
            file_date: Utc::now(),
            original_name: generated_name.clone(),
            generated_name,
            mime_type: None,
            file_extension: None,
            file_source: None,
            file_hierarchy: Vec::new(),
            file_size,
            file_checksum: file_checksum.into(),
            attributes: Attributes::new(),
        }
    }

    /// Draft whose size and checksum are taken from an in-memory buffer.
    pub fn for_content(generated_name: impl Into<String>, data: &[u8]) -> Self {
        Self::new(generated_name, data.len() as u64, crate::chunk::calculate_checksum(data))
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn with_file_date(mut self, file_date: DateTime<Utc>) -> Self {
        self.file_date = file_date;
        self
    }

    pub fn with_original_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = name.into();
        self
    }

    pub fn with_hierarchy<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_hierarchy = segments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = Some(extension.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.file_source = Some(source.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn policy(&self) -> UpsertPolicy {
        UpsertPolicy::resolve(self.deduplicate, self.id.as_ref())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.generated_name.trim().is_empty() {
            return Err(StorageError::InvalidMetadata("generated name must not be empty".into()));
        }
        validate_path_segment(&self.generated_name, "generated name")?;
        validate_checksum(&self.file_checksum)?;
        validate_hierarchy(&self.file_hierarchy)?;
        Ok(())
    }

    /// Builds the `new` record this draft asks the store to insert.
    pub(crate) fn into_record(self, chunk_size: u64, now: DateTime<Utc>) -> FileMetadata {
        FileMetadata {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            file_date: self.file_date.trunc_subsecs(0),
            record_date: now.trunc_subsecs(3),
            original_name: self.original_name,
            generated_name: self.generated_name,
            mime_type: non_empty(self.mime_type),
            file_extension: non_empty(self.file_extension),
            file_source: non_empty(self.file_source),
            file_hierarchy: self.file_hierarchy,
            file_size: self.file_size,
            file_checksum: self.file_checksum.to_ascii_lowercase(),
            file_chunk_size: chunk_size,
            attributes: self.attributes,
            status: FileStatus::New,
        }
    }
}

/// Sparse update of an existing record. `None` fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub id: Uuid,
    pub file_date: Option<DateTime<Utc>>,
    pub record_date: Option<DateTime<Utc>>,
    pub original_name: Option<String>,
    pub generated_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_extension: Option<String>,
    pub file_source: Option<String>,
    pub file_hierarchy: Option<Vec<String>>,
    pub file_size: Option<u64>,
    pub file_checksum: Option<String>,
    pub file_chunk_size: Option<u64>,
    pub attributes: Option<Attributes>,
    pub status: Option<FileStatus>,
}

impl MetadataPatch {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Drops empty strings and hierarchies, truncates timestamps the same
    /// way new records are, and rejects values no record may hold.
    pub fn normalized(mut self) -> Result<Self> {
        self.file_date = self.file_date.map(|d| d.trunc_subsecs(0));
        self.record_date = self.record_date.map(|d| d.trunc_subsecs(3));
        self.original_name = non_empty(self.original_name);
        self.generated_name = non_empty(self.generated_name);
        self.mime_type = non_empty(self.mime_type);
        self.file_extension = non_empty(self.file_extension);
        self.file_source = non_empty(self.file_source);
        self.file_checksum = non_empty(self.file_checksum).map(|c| c.to_ascii_lowercase());
        self.file_hierarchy = self.file_hierarchy.filter(|h| !h.is_empty());

        if let Some(name) = &self.generated_name {
            validate_path_segment(name, "generated name")?;
        }
        if let Some(checksum) = &self.file_checksum {
            validate_checksum(checksum)?;
        }
        if let Some(hierarchy) = &self.file_hierarchy {
            validate_hierarchy(hierarchy)?;
        }
        if self.file_chunk_size == Some(0) {
            return Err(StorageError::InvalidMetadata(
                "chunk size must be greater than zero".into(),
            ));
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.file_date.is_none()
            && self.record_date.is_none()
            && self.original_name.is_none()
            && self.generated_name.is_none()
            && self.mime_type.is_none()
            && self.file_extension.is_none()
            && self.file_source.is_none()
            && self.file_hierarchy.is_none()
            && self.file_size.is_none()
            && self.file_checksum.is_none()
            && self.file_chunk_size.is_none()
            && self.attributes.is_none()
            && self.status.is_none()
    }

    pub fn apply(&self, record: &mut FileMetadata) {
        if let Some(v) = self.file_date {
            record.file_date = v;
        }
        if let Some(v) = self.record_date {
            record.record_date = v;
        }
        if let Some(v) = &self.original_name {
            record.original_name = v.clone();
        }
        if let Some(v) = &self.generated_name {
            record.generated_name = v.clone();
        }
        if let Some(v) = &self.mime_type {
            record.mime_type = Some(v.clone());
        }
        if let Some(v) = &self.file_extension {
            record.file_extension = Some(v.clone());
        }
        if let Some(v) = &self.file_source {
            record.file_source = Some(v.clone());
        }
        if let Some(v) = &self.file_hierarchy {
            record.file_hierarchy = v.clone();
        }
        if let Some(v) = self.file_size {
            record.file_size = v;
        }
        if let Some(v) = &self.file_checksum {
            record.file_checksum = v.clone();
        }
        if let Some(v) = self.file_chunk_size {
            record.file_chunk_size = v;
        }
        if let Some(v) = &self.attributes {
            record.attributes = v.clone();
        }
        if let Some(v) = self.status {
            record.status = v;
        }
    }
}

/// Selection criteria for listing files. The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileFilter {
    /// Inclusive lower bound on `file_date`.
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `file_date`.
    pub end_date: Option<DateTime<Utc>>,
    /// Matches records sharing at least one segment with this list.
    pub file_hierarchy: Vec<String>,
    /// Substring of `generated_name`.
    pub file_name: Option<String>,
    pub id: Option<Uuid>,
}

impl FileFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_date(mut self, date: DateTime<Utc>) -> Self {
        self.start_date = Some(date);
        self
    }

    pub fn with_end_date(mut self, date: DateTime<Utc>) -> Self {
        self.end_date = Some(date);
        self
    }

    pub fn with_hierarchy<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_hierarchy = segments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn normalized(mut self) -> Self {
        self.file_hierarchy.retain(|s| !s.is_empty());
        self.file_name = non_empty(self.file_name);
        self
    }

    pub fn matches(&self, record: &FileMetadata) -> bool {
        if let Some(start) = self.start_date {
            if record.file_date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if record.file_date > end {
                return false;
            }
        }
        if !self.file_hierarchy.is_empty()
            && !record
                .file_hierarchy
                .iter()
                .any(|segment| self.file_hierarchy.contains(segment))
        {
            return false;
        }
        if let Some(name) = &self.file_name {
            if !record.generated_name.contains(name.as_str()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if &record.id != id {
                return false;
            }
        }
        true
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn validate_checksum(checksum: &str) -> Result<()> {
    if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(StorageError::InvalidMetadata(format!(
            "checksum '{}' is not a hex encoded sha256 digest",
            checksum
        )));
    }
    Ok(())
}

fn validate_hierarchy(hierarchy: &[String]) -> Result<()> {
    if hierarchy.iter().any(|s| s.is_empty()) {
        return Err(StorageError::InvalidMetadata("hierarchy segments must not be empty".into()));
    }
    for segment in hierarchy {
        validate_path_segment(segment, "hierarchy segment")?;
    }
    Ok(())
}

/// Names and hierarchy segments become path components on download, so each
/// must be a single plain component: no separators, no `..`, no root.
pub fn is_plain_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c.to_str() == Some(value)
    )
}

fn validate_path_segment(value: &str, what: &str) -> Result<()> {
    if !is_plain_component(value) {
        return Err(StorageError::InvalidMetadata(format!(
            "{} '{}' must be a single path component",
            what, value
        )));
    }
    Ok(())
}
