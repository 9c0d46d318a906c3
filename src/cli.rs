use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::fs;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use chunkstore::catalog::{group_by_hierarchy, Catalog};
use chunkstore::{
    is_plain_component, ContentDigest, FileFilter, FileHandle, FileMetadata, FileTypeDetector,
    MetadataPatch, NewFile, Result, StorageError,
};

const SNIFF_LEN: usize = 8192;
const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "chunkstore-cli")]
#[command(about = "Chunked file store CLI", long_about = None)]
pub struct Cli {
    /// TOML file with store settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// sqlite: URL of the database, overrides the config file
    #[arg(short, long)]
    pub database: Option<String>,

    /// Chunk size in bytes for newly uploaded files
    #[arg(long)]
    pub chunk_size: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Summarize matching files by hierarchy
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Write matching files below a directory
    Download {
        #[arg(short, long)]
        path: PathBuf,

        /// Put every file directly in PATH
        #[arg(long)]
        flat: bool,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Upload a file to storage
    Upload {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long = "hierarchy")]
        hierarchy: Vec<String>,

        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        id: Option<Uuid>,

        /// Store a new record even if the content is already stored
        #[arg(long)]
        no_dedup: bool,

        #[arg(long, value_parser = parse_start_date)]
        file_date: Option<DateTime<Utc>>,
    },

    /// Change fields of a stored file
    Update {
        #[arg(long)]
        id: Uuid,

        #[arg(long)]
        generated_name: Option<String>,

        #[arg(long)]
        original_name: Option<String>,

        #[arg(long)]
        source: Option<String>,

        #[arg(long = "hierarchy")]
        hierarchy: Vec<String>,
    },

    /// Check stored chunks of matching files
    Verify {
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Args, Debug)]
pub struct FilterArgs {
    /// Earliest file date, RFC 3339 or YYYY-MM-DD
    #[arg(long, value_parser = parse_start_date)]
    pub start_date: Option<DateTime<Utc>>,

    /// Latest file date; a bare date covers the whole day
    #[arg(long, value_parser = parse_end_date)]
    pub end_date: Option<DateTime<Utc>>,

    #[arg(long = "hierarchy")]
    pub hierarchy: Vec<String>,

    /// Substring of the stored file name
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub id: Option<Uuid>,
}

impl FilterArgs {
    pub fn into_filter(self) -> FileFilter {
        FileFilter {
            start_date: self.start_date,
            end_date: self.end_date,
            file_hierarchy: self.hierarchy,
            file_name: self.name,
            id: self.id,
        }
    }
}

pub async fn execute_command(catalog: &Catalog, command: Commands) -> Result<()> {
    match command {
        Commands::List { filter } => {
            let files = catalog.list(filter.into_filter()).await?;
            print_summary(&files);
        }
        Commands::Download { path, flat, filter } => {
            let files = catalog.list(filter.into_filter()).await?;
            download_files(&files, &path, flat).await?;
            print_summary(&files);
        }
        Commands::Upload {
            file,
            hierarchy,
            source,
            id,
            no_dedup,
            file_date,
        } => {
            let mut draft = describe_file(&file)
                .await?
                .with_hierarchy(hierarchy)
                .with_deduplicate(!no_dedup);
            if let Some(source) = source {
                draft = draft.with_source(source);
            }
            if let Some(id) = id {
                draft = draft.with_id(id);
            }
            if let Some(date) = file_date {
                draft = draft.with_file_date(date);
            }
            upload_file(catalog, draft, &file).await?;
        }
        Commands::Update {
            id,
            generated_name,
            original_name,
            source,
            hierarchy,
        } => {
            let mut patch = MetadataPatch::new(id);
            patch.generated_name = generated_name;
            patch.original_name = original_name;
            patch.file_source = source;
            patch.file_hierarchy = Some(hierarchy);

            match catalog.update(patch).await? {
                Some(record) => {
                    let json = serde_json::to_string_pretty(&record)
                        .map_err(|e| StorageError::Storage(e.to_string()))?;
                    println!("{}", json);
                }
                None => println!("File {} not found", id),
            }
        }
        Commands::Verify { filter } => {
            let files = catalog.list(filter.into_filter()).await?;
            let validator = catalog.validator();
            let mut failed = 0;
            for file in &files {
                let metadata = file.metadata();
                let report = validator.validate_file(metadata).await?;
                if report.is_valid() {
                    println!("ok      {} {}", metadata.id, metadata.generated_name);
                } else {
                    failed += 1;
                    println!("FAILED  {} {}", metadata.id, metadata.generated_name);
                    for issue in &report.issues {
                        println!("        chunk {}: {:?}", issue.chunk_number, issue.problem);
                    }
                    if report.issues.is_empty() {
                        println!("        whole-file checksum does not match");
                    }
                }
            }
            println!("Verified {} file(s), {} failed", files.len(), failed);
        }
    }
    Ok(())
}

fn print_summary(files: &[FileHandle]) {
    for group in group_by_hierarchy(files) {
        println!("{} file(s) of type {}", group.count, group.hierarchy);
    }
    let total: u64 = files.iter().map(|f| f.metadata().file_size).sum();
    println!("Total file count: {}", files.len());
    println!("Total file size: {}", format_file_size(total));
}

/// `dest/<hierarchy...>/<generated name>`, or `dest/<generated name>` when flat.
/// Stored values that would leave `dest` are refused.
fn download_target(dest: &Path, metadata: &FileMetadata, flat: bool) -> Result<PathBuf> {
    let mut target = dest.to_path_buf();
    let segments: &[String] = if flat { &[] } else { &metadata.file_hierarchy };
    for segment in segments.iter().chain(std::iter::once(&metadata.generated_name)) {
        if !is_plain_component(segment) {
            return Err(StorageError::InvalidMetadata(format!(
                "file {} has '{}' in its path, refusing to write outside {}",
                metadata.id,
                segment,
                dest.display()
            )));
        }
        target.push(segment);
    }
    if !target.starts_with(dest) {
        return Err(StorageError::InvalidMetadata(format!(
            "file {} resolves outside {}",
            metadata.id,
            dest.display()
        )));
    }
    Ok(target)
}

async fn download_files(files: &[FileHandle], dest: &Path, flat: bool) -> Result<()> {
    let width = files.len().to_string().len();
    for (i, file) in files.iter().enumerate() {
        let metadata = file.metadata();
        let target = download_target(dest, metadata, flat)?;
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).await?;
        }

        let mut out = fs::File::create(&target).await?;
        file.download_to(&mut out).await?;

        println!(
            "downloading {:>width$} / {} {} {}",
            i + 1,
            files.len(),
            metadata.file_date.format("%Y-%m-%d"),
            metadata.hierarchy_path(),
            width = width
        );
    }
    Ok(())
}

/// Builds a draft from a file on disk: name, size, checksum and content type.
async fn describe_file(path: &Path) -> Result<NewFile> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            StorageError::InvalidMetadata(format!("{} has no usable file name", path.display()))
        })?
        .to_string();

    let mut file = fs::File::open(path).await?;
    let mut digest = ContentDigest::new();
    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        if head.len() < SNIFF_LEN {
            let take = n.min(SNIFF_LEN - head.len());
            head.extend_from_slice(&buffer[..take]);
        }
        digest.update(&buffer[..n]);
    }

    let size = digest.bytes();
    let content_type = FileTypeDetector::detect(path, &head);
    let mut draft = NewFile::new(name, size, digest.finalize());
    if let Some(mime_type) = content_type.mime_type {
        draft = draft.with_mime_type(mime_type);
    }
    if let Some(extension) = content_type.extension {
        draft = draft.with_extension(extension);
    }
    Ok(draft)
}

async fn upload_file(catalog: &Catalog, draft: NewFile, path: &Path) -> Result<()> {
    let handle = catalog.save(draft).await?;
    let id = handle.metadata().id;
    if handle.metadata().is_finished() {
        println!("File already stored as {}", id);
        return Ok(());
    }

    // checked against the draft's size and checksum before the file is finished
    let mut file = fs::File::open(path).await?;
    let summary = handle.upload_from(&mut file).await?;
    println!(
        "Uploaded {} as {} ({} chunks, {})",
        path.display(),
        id,
        summary.chunk_count,
        format_file_size(summary.byte_count)
    );
    Ok(())
}

/// Human readable size with 1024-based units, truncated to two decimals.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut power = 0;
    let mut scaled = bytes;
    while scaled >= 1024 && power < UNITS.len() - 1 {
        scaled /= 1024;
        power += 1;
    }
    let divisor = 1024u128.pow(power as u32);
    let hundredths = (bytes as u128 * 100) / divisor;
    let whole = hundredths / 100;
    let fraction = hundredths % 100;
    let size = match fraction {
        0 => whole.to_string(),
        f if f % 10 == 0 => format!("{}.{}", whole, f / 10),
        f => format!("{}.{:02}", whole, f),
    };
    format!("{} {}", size, UNITS[power])
}

fn parse_start_date(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_date(value, NaiveTime::default())
}

fn parse_end_date(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default();
    parse_date(value, end_of_day)
}

fn parse_date(value: &str, time_of_day: NaiveTime) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| date.and_time(time_of_day).and_utc())
        .map_err(|_| format!("'{}' is neither an RFC 3339 timestamp nor YYYY-MM-DD", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(1023), "1023 B");
        assert_eq!(format_file_size(1024), "1 kB");
        assert_eq!(format_file_size(1536), "1.5 kB");
        assert_eq!(format_file_size(1025), "1 kB");
        assert_eq!(format_file_size(1024 * 1024 - 1), "1023.99 kB");
        assert_eq!(format_file_size(5 * 1024 * 1024 * 1024), "5 GB");
    }

    #[test]
    fn test_parse_dates() {
        assert_eq!(
            parse_start_date("2021-03-04").unwrap(),
            Utc.with_ymd_and_hms(2021, 3, 4, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_end_date("2021-03-04").unwrap(),
            Utc.with_ymd_and_hms(2021, 3, 4, 23, 59, 59).unwrap()
        );
        assert_eq!(
            parse_end_date("2021-03-04T10:00:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2021, 3, 4, 8, 0, 0).unwrap()
        );
        assert!(parse_start_date("yesterday").is_err());
    }

    fn metadata_with(name: &str, hierarchy: &[String]) -> FileMetadata {
        FileMetadata {
            id: Uuid::new_v4(),
            file_date: Utc::now(),
            record_date: Utc::now(),
            original_name: name.to_string(),
            generated_name: name.to_string(),
            mime_type: None,
            file_extension: None,
            file_source: None,
            file_hierarchy: hierarchy.to_vec(),
            file_size: 0,
            file_checksum: chunkstore::calculate_checksum(b""),
            file_chunk_size: 4,
            attributes: Default::default(),
            status: chunkstore::FileStatus::Finished,
        }
    }

    #[test]
    fn test_download_target_stays_below_destination() {
        let dest = tempfile::TempDir::new().unwrap();
        let nested = metadata_with("x.txt", &["docs".into(), "2020".into()]);
        assert_eq!(
            download_target(dest.path(), &nested, false).unwrap(),
            dest.path().join("docs").join("2020").join("x.txt")
        );
        assert_eq!(
            download_target(dest.path(), &nested, true).unwrap(),
            dest.path().join("x.txt")
        );

        let outside = std::env::temp_dir().join("chunkstore_escape_dir");
        let absolute = metadata_with("x.txt", &[outside.display().to_string()]);
        assert!(download_target(dest.path(), &absolute, false).is_err());

        let climbing = metadata_with("x.txt", &["..".into(), "..".into()]);
        assert!(download_target(dest.path(), &climbing, false).is_err());

        let bad_name = metadata_with("../x.txt", &[]);
        assert!(download_target(dest.path(), &bad_name, true).is_err());
        assert!(!outside.join("x.txt").exists());
    }

    #[test]
    fn test_cli_parses_filters() {
        let cli = Cli::try_parse_from([
            "chunkstore-cli",
            "--database",
            "sqlite::memory:",
            "list",
            "--hierarchy",
            "a",
            "--hierarchy",
            "b",
            "--name",
            "inv",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::List { filter }) => {
                assert_eq!(filter.hierarchy, vec!["a", "b"]);
                assert_eq!(filter.name.as_deref(), Some("inv"));
            }
            _ => panic!("expected list"),
        }
    }
}
