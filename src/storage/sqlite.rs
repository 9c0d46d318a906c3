use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChunkStore, MetadataStore, StorageBackend};
use crate::config::StoreConfig;
use crate::{
    Chunk, FileFilter, FileMetadata, FileStatus, MetadataPatch, Result, StorageError, UpsertPolicy,
};

// Fixed width so that text comparison orders chronologically.
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const DATE_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY,
        file_date TEXT NOT NULL,
        record_date TEXT NOT NULL,
        original_name TEXT NOT NULL,
        generated_name TEXT NOT NULL,
        mime_type TEXT,
        file_extension TEXT,
        source TEXT,
        file_hierarchy TEXT NOT NULL DEFAULT '[]',
        file_size INTEGER NOT NULL CHECK(file_size >= 0),
        file_sha256sum TEXT NOT NULL,
        chunk_size INTEGER NOT NULL CHECK(chunk_size > 0),
        attributes TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL CHECK(status IN ('new', 'finished'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_files_checksum ON files(file_sha256sum)",
    "CREATE INDEX IF NOT EXISTS idx_files_file_date ON files(file_date)",
    r#"
    CREATE TABLE IF NOT EXISTS file_chunks (
        file_id TEXT NOT NULL REFERENCES files(id),
        chunk_number INTEGER NOT NULL CHECK(chunk_number >= 0),
        chunk_sha256sum TEXT NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (file_id, chunk_number)
    )
    "#,
];

const FILE_COLUMNS: &str = "id, file_date, record_date, original_name, generated_name, \
    mime_type, file_extension, source, file_hierarchy, file_size, file_sha256sum, chunk_size, \
    attributes, status";
const FILE_PLACEHOLDERS: &str = "?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14";

const SELECT_MATCHING: &str = r#"
    SELECT * FROM files
    WHERE (?1 IS NULL OR file_date >= ?1)
      AND (?2 IS NULL OR file_date <= ?2)
      AND (?3 IS NULL OR EXISTS (
            SELECT 1 FROM json_each(files.file_hierarchy) AS segment
            WHERE segment.value IN (SELECT value FROM json_each(?3))))
      AND (?4 IS NULL OR instr(generated_name, ?4) > 0)
      AND (?5 IS NULL OR id = ?5)
    ORDER BY file_date, rowid
"#;

/// Files and chunks in a SQLite database, shared through one connection pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the pool described by `config` and creates the schema if missing.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let opts = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| {
                StorageError::Configuration(format!(
                    "invalid database url '{}': {}",
                    config.database_url, e
                ))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if config.is_in_memory() {
            // the database disappears with its last connection
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            if let Some(parent) = opts.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(config.idle_timeout())
        };

        let pool = pool_options.connect_with(opts).await?;
        let store = Self { pool };
        store.migrate().await?;

        info!("Opened file store at {}", config.database_url);
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    async fn fetch_by_id(&self, id: &Uuid) -> Result<Option<FileMetadata>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(FileMetadata::try_from).transpose()
    }
}

#[derive(FromRow)]
struct FileRow {
    id: String,
    file_date: String,
    record_date: String,
    original_name: String,
    generated_name: String,
    mime_type: Option<String>,
    file_extension: Option<String>,
    source: Option<String>,
    file_hierarchy: String,
    file_size: i64,
    file_sha256sum: String,
    chunk_size: i64,
    attributes: String,
    status: String,
}

impl TryFrom<FileRow> for FileMetadata {
    type Error = StorageError;

    fn try_from(row: FileRow) -> Result<Self> {
        let id = parse_id(&row.id)?;
        let file_chunk_size = from_i64(row.chunk_size, "chunk_size")?;
        if file_chunk_size == 0 {
            return Err(StorageError::Storage(format!("file {} has a chunk size of zero", id)));
        }
        Ok(FileMetadata {
            id,
            file_date: parse_date(&row.file_date)?,
            record_date: parse_date(&row.record_date)?,
            original_name: row.original_name,
            generated_name: row.generated_name,
            mime_type: row.mime_type,
            file_extension: row.file_extension,
            file_source: row.source,
            file_hierarchy: decode_json(&row.file_hierarchy, "file_hierarchy")?,
            file_size: from_i64(row.file_size, "file_size")?,
            file_checksum: row.file_sha256sum,
            file_chunk_size,
            attributes: decode_json(&row.attributes, "attributes")?,
            status: row.status.parse::<FileStatus>()?,
        })
    }
}

#[derive(FromRow)]
struct ChunkRow {
    file_id: String,
    chunk_number: i64,
    chunk_sha256sum: String,
    data: Vec<u8>,
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = StorageError;

    fn try_from(row: ChunkRow) -> Result<Self> {
        Ok(Chunk {
            file_id: parse_id(&row.file_id)?,
            chunk_number: from_i64(row.chunk_number, "chunk_number")?,
            checksum: row.chunk_sha256sum,
            data: row.data,
        })
    }
}

/// A file record in column form, ready to bind as `?1..?14`.
struct EncodedRecord {
    id: String,
    file_date: String,
    record_date: String,
    original_name: String,
    generated_name: String,
    mime_type: Option<String>,
    file_extension: Option<String>,
    source: Option<String>,
    file_hierarchy: String,
    file_size: i64,
    file_sha256sum: String,
    chunk_size: i64,
    attributes: String,
    status: &'static str,
}

impl EncodedRecord {
    fn new(record: &FileMetadata) -> Result<Self> {
        Ok(Self {
            id: record.id.to_string(),
            file_date: format_date(&record.file_date),
            record_date: format_date(&record.record_date),
            original_name: record.original_name.clone(),
            generated_name: record.generated_name.clone(),
            mime_type: record.mime_type.clone(),
            file_extension: record.file_extension.clone(),
            source: record.file_source.clone(),
            file_hierarchy: encode_json(&record.file_hierarchy)?,
            file_size: to_i64(record.file_size, "file_size")?,
            file_sha256sum: record.file_checksum.clone(),
            chunk_size: to_i64(record.file_chunk_size, "chunk_size")?,
            attributes: encode_json(&record.attributes)?,
            status: record.status.as_str(),
        })
    }

    fn bind<'q>(
        &'q self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.id.as_str())
            .bind(self.file_date.as_str())
            .bind(self.record_date.as_str())
            .bind(self.original_name.as_str())
            .bind(self.generated_name.as_str())
            .bind(self.mime_type.as_deref())
            .bind(self.file_extension.as_deref())
            .bind(self.source.as_deref())
            .bind(self.file_hierarchy.as_str())
            .bind(self.file_size)
            .bind(self.file_sha256sum.as_str())
            .bind(self.chunk_size)
            .bind(self.attributes.as_str())
            .bind(self.status)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn upsert_metadata(
        &self,
        record: &FileMetadata,
        policy: UpsertPolicy,
    ) -> Result<FileMetadata> {
        let encoded = EncodedRecord::new(record)?;
        let insert = match policy {
            // ?11 is the checksum
            UpsertPolicy::ByChecksum => format!(
                "INSERT INTO files ({}) SELECT {} \
                 WHERE NOT EXISTS (SELECT 1 FROM files WHERE file_sha256sum = ?11)",
                FILE_COLUMNS, FILE_PLACEHOLDERS
            ),
            UpsertPolicy::ById => format!(
                "INSERT INTO files ({}) VALUES ({}) ON CONFLICT(id) DO NOTHING",
                FILE_COLUMNS, FILE_PLACEHOLDERS
            ),
            UpsertPolicy::AlwaysInsert => format!(
                "INSERT INTO files ({}) VALUES ({})",
                FILE_COLUMNS, FILE_PLACEHOLDERS
            ),
        };

        let inserted = encoded
            .bind(sqlx::query(&insert))
            .execute(&self.pool)
            .await?
            .rows_affected();

        let row = match policy {
            UpsertPolicy::ByChecksum => {
                sqlx::query_as::<_, FileRow>(
                    "SELECT * FROM files WHERE file_sha256sum = ?1 ORDER BY rowid LIMIT 1",
                )
                    .bind(encoded.file_sha256sum.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            UpsertPolicy::ById | UpsertPolicy::AlwaysInsert => {
                sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?1")
                    .bind(encoded.id.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        let stored = FileMetadata::try_from(row)?;
        if inserted == 0 {
            info!("Reusing existing record {} ({:?})", stored.id, policy);
        } else {
            debug!(file_id = %stored.id, "inserted file record");
        }
        Ok(stored)
    }

    async fn update_status(&self, file_id: &Uuid) -> Result<()> {
        let updated = sqlx::query("UPDATE files SET status = ?1 WHERE id = ?2")
            .bind(FileStatus::Finished.as_str())
            .bind(file_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StorageError::NotFound(file_id.to_string()));
        }
        Ok(())
    }

    async fn update_fields(&self, patch: &MetadataPatch) -> Result<Option<FileMetadata>> {
        if patch.is_empty() {
            return self.fetch_by_id(&patch.id).await;
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE files SET ");
        let mut fields = builder.separated(", ");
        if let Some(v) = &patch.file_date {
            fields.push("file_date = ").push_bind_unseparated(format_date(v));
        }
        if let Some(v) = &patch.record_date {
            fields.push("record_date = ").push_bind_unseparated(format_date(v));
        }
        if let Some(v) = &patch.original_name {
            fields.push("original_name = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = &patch.generated_name {
            fields.push("generated_name = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = &patch.mime_type {
            fields.push("mime_type = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = &patch.file_extension {
            fields.push("file_extension = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = &patch.file_source {
            fields.push("source = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = &patch.file_hierarchy {
            fields.push("file_hierarchy = ").push_bind_unseparated(encode_json(v)?);
        }
        if let Some(v) = patch.file_size {
            fields.push("file_size = ").push_bind_unseparated(to_i64(v, "file_size")?);
        }
        if let Some(v) = &patch.file_checksum {
            fields.push("file_sha256sum = ").push_bind_unseparated(v.clone());
        }
        if let Some(v) = patch.file_chunk_size {
            fields.push("chunk_size = ").push_bind_unseparated(to_i64(v, "chunk_size")?);
        }
        if let Some(v) = &patch.attributes {
            fields.push("attributes = ").push_bind_unseparated(encode_json(v)?);
        }
        if let Some(v) = patch.status {
            fields.push("status = ").push_bind_unseparated(v.as_str());
        }
        builder
            .push(" WHERE id = ")
            .push_bind(patch.id.to_string())
            .push(" RETURNING *");

        let row = builder
            .build_query_as::<FileRow>()
            .fetch_optional(&self.pool)
            .await?;
        row.map(FileMetadata::try_from).transpose()
    }

    async fn query_metadata(&self, filter: &FileFilter) -> Result<Vec<FileMetadata>> {
        let hierarchy = if filter.file_hierarchy.is_empty() {
            None
        } else {
            Some(encode_json(&filter.file_hierarchy)?)
        };

        let rows = sqlx::query_as::<_, FileRow>(SELECT_MATCHING)
            .bind(filter.start_date.as_ref().map(format_start_bound))
            .bind(filter.end_date.as_ref().map(format_date))
            .bind(hierarchy)
            .bind(filter.file_name.clone())
            .bind(filter.id.map(|id| id.to_string()))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(FileMetadata::try_from).collect()
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn write_chunk(&self, chunk: &Chunk) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_chunks (file_id, chunk_number, chunk_sha256sum, data) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(chunk.file_id.to_string())
        .bind(to_i64(chunk.chunk_number, "chunk_number")?)
        .bind(chunk.checksum.as_str())
        .bind(chunk.data.as_slice())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_chunk(&self, file_id: &Uuid, chunk_number: u64) -> Result<Option<Chunk>> {
        let row = sqlx::query_as::<_, ChunkRow>(
            "SELECT file_id, chunk_number, chunk_sha256sum, data FROM file_chunks \
             WHERE file_id = ?1 AND chunk_number = ?2",
        )
        .bind(file_id.to_string())
        .bind(to_i64(chunk_number, "chunk_number")?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Chunk::try_from).transpose()
    }
}

#[async_trait]
impl StorageBackend for SqliteStore {
    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("Closed file store");
        }
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

// Stored dates carry milliseconds, so a finer lower bound rounds up.
fn format_start_bound(date: &DateTime<Utc>) -> String {
    let millis = date.trunc_subsecs(3);
    if millis < *date {
        format_date(&(millis + chrono::Duration::milliseconds(1)))
    } else {
        format_date(date)
    }
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DATE_PARSE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| StorageError::Storage(format!("stored date '{}' is malformed: {}", value, e)))
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| StorageError::Storage(format!("failed to encode json: {}", e)))
}

fn decode_json<T: serde::de::DeserializeOwned>(value: &str, column: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| StorageError::Storage(format!("failed to parse {}: {}", column, e)))
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidMetadata(format!("{} {} is out of range", field, value)))
}

fn from_i64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::Storage(format!("stored {} {} is negative", column, value)))
}

fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        StorageError::Storage(format!("stored file id '{}' is not a uuid: {}", value, e))
    })
}
