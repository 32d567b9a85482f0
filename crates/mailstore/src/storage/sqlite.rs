//! SQLite-based metadata storage
//!
//! One connection guarded by a mutex; every statement runs on the blocking
//! thread pool so callers never stall the async runtime. Enumerations page
//! through rows by rowid instead of materializing whole tables.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};
use uuid::Uuid;

use super::blob::BucketName;
use super::schema::{decode_attachments, decode_properties, encode_attachments, encode_properties};
use super::traits::{MessageRow, MetadataStore, prepend_attachments};
use crate::error::{Result, StoreError};
use crate::models::{
    AttachmentId, AttachmentRecord, BlobId, ContentType, MessageId, UploadId, UploadMetadata,
    Username,
};

/// Rows fetched per round trip when streaming a table
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Message metadata; content lives in the blob store
            CREATE TABLE messages (
                message_id TEXT PRIMARY KEY,
                internal_date TEXT NOT NULL,
                body_start_octet INTEGER NOT NULL,
                full_content_octets INTEGER NOT NULL,
                body_octets INTEGER NOT NULL,
                header_blob_id TEXT NOT NULL,
                body_blob_id TEXT NOT NULL,
                properties TEXT NOT NULL,
                attachments TEXT  -- versioned JSON, NULL when empty
            );

            -- Attachment metadata; message_id is NULL on rows written
            -- before the owning message was known
            CREATE TABLE attachments (
                attachment_id TEXT PRIMARY KEY,
                message_id TEXT,
                blob_id TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL
            );

            -- Upload metadata partitioned by weekly bucket
            CREATE TABLE uploads (
                bucket TEXT NOT NULL,
                upload_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                blob_id TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                uploaded_at TEXT NOT NULL,
                PRIMARY KEY (bucket, upload_id)
            );

            CREATE INDEX idx_uploads_upload_id ON uploads(upload_id);
            "#,
        ),
        // Migration 2: Per-owner upload listing
        M::up(
            r#"
            CREATE INDEX idx_uploads_owner ON uploads(owner, uploaded_at ASC);
            "#,
        ),
    ])
}

/// SQLite-based metadata storage
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
    page_size: usize,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `db_path` and bring it to the latest schema
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        info!("Opened metadata database at {:?}", db_path.as_ref());
        Self::from_connection(conn)
    }

    /// Database living only as long as this store
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets readers proceed during writes; NORMAL sync is safe with WAL
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Rows fetched per round trip by the streaming enumerations
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut guard)
        })
        .await?
    }

    /// Stream a table page by page, keyed on rowid
    fn paged<T, F>(&self, fetch: F) -> BoxStream<'static, Result<T>>
    where
        F: Fn(&Connection, i64, usize) -> Result<Vec<(i64, T)>> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let fetch = Arc::new(fetch);
        let page_size = self.page_size;

        stream::try_unfold(Some(0i64), move |cursor| {
            let conn = Arc::clone(&conn);
            let fetch = Arc::clone(&fetch);
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let page = tokio::task::spawn_blocking(move || {
                    let guard = lock(&conn)?;
                    fetch(&guard, after, page_size)
                })
                .await??;

                let next = if page.len() < page_size {
                    None
                } else {
                    page.last().map(|(rowid, _)| *rowid)
                };
                let items: Vec<T> = page.into_iter().map(|(_, item)| item).collect();
                Ok::<_, StoreError>(Some((items, next)))
            }
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| StoreError::Storage(anyhow!("sqlite connection lock poisoned")))
}

fn format_time(instant: &DateTime<Utc>) -> String {
    // Fixed width so lexical order matches chronological order
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}' in database", value))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_upload_id(value: &str) -> Result<UploadId> {
    let uuid = Uuid::parse_str(value)
        .with_context(|| format!("Invalid upload id '{}' in database", value))?;
    Ok(UploadId(uuid))
}

/// Raw message columns as read from SQLite
struct RawMessage {
    message_id: String,
    internal_date: String,
    body_start_octet: i64,
    full_content_octets: i64,
    body_octets: i64,
    header_blob_id: String,
    body_blob_id: String,
    properties: String,
    attachments: Option<String>,
}

impl RawMessage {
    const COLUMNS: &'static str = "message_id, internal_date, body_start_octet, \
        full_content_octets, body_octets, header_blob_id, body_blob_id, properties, attachments";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get(0)?,
            internal_date: row.get(1)?,
            body_start_octet: row.get(2)?,
            full_content_octets: row.get(3)?,
            body_octets: row.get(4)?,
            header_blob_id: row.get(5)?,
            body_blob_id: row.get(6)?,
            properties: row.get(7)?,
            attachments: row.get(8)?,
        })
    }

    fn into_row(self) -> Result<MessageRow> {
        Ok(MessageRow {
            message_id: MessageId::new(self.message_id),
            internal_date: parse_time(&self.internal_date)?,
            body_start_octet: self.body_start_octet as usize,
            full_content_octets: self.full_content_octets as u64,
            body_octets: self.body_octets as u64,
            header_blob_id: BlobId::new(self.header_blob_id),
            body_blob_id: BlobId::new(self.body_blob_id),
            properties: decode_properties(&self.properties)?,
            attachments: decode_attachments(self.attachments.as_deref())?,
        })
    }
}

/// Raw upload columns as read from SQLite
struct RawUpload {
    bucket: String,
    upload_id: String,
    owner: String,
    blob_id: String,
    content_type: String,
    size: i64,
    uploaded_at: String,
}

impl RawUpload {
    const COLUMNS: &'static str =
        "bucket, upload_id, owner, blob_id, content_type, size, uploaded_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            bucket: row.get(0)?,
            upload_id: row.get(1)?,
            owner: row.get(2)?,
            blob_id: row.get(3)?,
            content_type: row.get(4)?,
            size: row.get(5)?,
            uploaded_at: row.get(6)?,
        })
    }

    fn into_upload(self) -> Result<(BucketName, UploadMetadata)> {
        let upload = UploadMetadata {
            upload_id: parse_upload_id(&self.upload_id)?,
            owner: Username::new(self.owner),
            blob_id: BlobId::new(self.blob_id),
            content_type: ContentType::new(self.content_type),
            size: self.size as u64,
            uploaded_at: parse_time(&self.uploaded_at)?,
        };
        Ok((BucketName::new(self.bucket), upload))
    }
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<AttachmentRecord> {
    let message_id: Option<String> = row.get(1)?;
    let size: i64 = row.get(4)?;
    Ok(AttachmentRecord {
        attachment_id: AttachmentId::new(row.get::<_, String>(0)?),
        message_id: message_id.map(MessageId::new),
        blob_id: BlobId::new(row.get::<_, String>(2)?),
        content_type: ContentType::new(row.get::<_, String>(3)?),
        size: size as u64,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn upsert_message(&self, row: MessageRow) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT attachments FROM messages WHERE message_id = ?",
                    [row.message_id.as_str()],
                    |r| r.get(0),
                )
                .optional()?;
            let attachments = match existing {
                Some(column) => {
                    prepend_attachments(row.attachments, decode_attachments(column.as_deref())?)
                }
                None => row.attachments,
            };

            tx.execute(
                "INSERT INTO messages
                 (message_id, internal_date, body_start_octet, full_content_octets, body_octets,
                  header_blob_id, body_blob_id, properties, attachments)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(message_id) DO UPDATE SET
                    internal_date = excluded.internal_date,
                    body_start_octet = excluded.body_start_octet,
                    full_content_octets = excluded.full_content_octets,
                    body_octets = excluded.body_octets,
                    header_blob_id = excluded.header_blob_id,
                    body_blob_id = excluded.body_blob_id,
                    properties = excluded.properties,
                    attachments = excluded.attachments",
                params![
                    row.message_id.as_str(),
                    format_time(&row.internal_date),
                    row.body_start_octet as i64,
                    row.full_content_octets as i64,
                    row.body_octets as i64,
                    row.header_blob_id.as_str(),
                    row.body_blob_id.as_str(),
                    encode_properties(&row.properties)?,
                    encode_attachments(&attachments)?,
                ],
            )?;

            tx.commit()?;
            debug!("Upserted message row {}", row.message_id);
            Ok(())
        })
        .await
    }

    async fn get_message(&self, id: &MessageId) -> Result<Option<MessageRow>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM messages WHERE message_id = ?",
                        RawMessage::COLUMNS
                    ),
                    [id.as_str()],
                    RawMessage::from_row,
                )
                .optional()?;
            raw.map(RawMessage::into_row).transpose()
        })
        .await
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM messages WHERE message_id = ?", [id.as_str()])?;
            Ok(())
        })
        .await
    }

    fn list_message_blobs(&self) -> BoxStream<'static, Result<(BlobId, BlobId)>> {
        self.paged(|conn, after, limit| {
            let mut stmt = conn.prepare_cached(
                "SELECT rowid, header_blob_id, body_blob_id FROM messages
                 WHERE rowid > ? ORDER BY rowid LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![after, limit as i64], |row| {
                    let header: String = row.get(1)?;
                    let body: String = row.get(2)?;
                    Ok((row.get(0)?, (BlobId::new(header), BlobId::new(body))))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn store_attachment(&self, record: AttachmentRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO attachments (attachment_id, message_id, blob_id, content_type, size)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(attachment_id) DO UPDATE SET
                    message_id = excluded.message_id,
                    blob_id = excluded.blob_id,
                    content_type = excluded.content_type,
                    size = excluded.size",
                params![
                    record.attachment_id.as_str(),
                    record.message_id.as_ref().map(|id| id.as_str()),
                    record.blob_id.as_str(),
                    record.content_type.as_str(),
                    record.size as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_attachment(&self, id: &AttachmentId) -> Result<Option<AttachmentRecord>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT attachment_id, message_id, blob_id, content_type, size
                     FROM attachments WHERE attachment_id = ?",
                    [id.as_str()],
                    attachment_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn set_attachment_message_id(
        &self,
        id: &AttachmentId,
        message_id: &MessageId,
    ) -> Result<bool> {
        let id = id.clone();
        let message_id = message_id.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE attachments SET message_id = ? WHERE attachment_id = ?",
                params![message_id.as_str(), id.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn delete_attachment(&self, id: &AttachmentId) -> Result<()> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM attachments WHERE attachment_id = ?",
                [id.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    fn list_attachment_blobs(&self) -> BoxStream<'static, Result<BlobId>> {
        self.paged(|conn, after, limit| {
            let mut stmt = conn.prepare_cached(
                "SELECT rowid, blob_id FROM attachments
                 WHERE rowid > ? ORDER BY rowid LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![after, limit as i64], |row| {
                    let blob_id: String = row.get(1)?;
                    Ok((row.get(0)?, BlobId::new(blob_id)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn store_upload(&self, bucket: &BucketName, upload: UploadMetadata) -> Result<()> {
        let bucket = bucket.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO uploads
                 (bucket, upload_id, owner, blob_id, content_type, size, uploaded_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    bucket.as_str(),
                    upload.upload_id.to_string(),
                    upload.owner.as_str(),
                    upload.blob_id.as_str(),
                    upload.content_type.as_str(),
                    upload.size as i64,
                    format_time(&upload.uploaded_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn find_upload(&self, id: &UploadId) -> Result<Option<(BucketName, UploadMetadata)>> {
        let id = *id;
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM uploads WHERE upload_id = ? LIMIT 1",
                        RawUpload::COLUMNS
                    ),
                    [id.to_string()],
                    RawUpload::from_row,
                )
                .optional()?;
            raw.map(RawUpload::into_upload).transpose()
        })
        .await
    }

    async fn list_uploads(&self, owner: &Username) -> Result<Vec<UploadMetadata>> {
        let owner = owner.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM uploads WHERE owner = ? ORDER BY uploaded_at ASC, upload_id ASC",
                RawUpload::COLUMNS
            ))?;
            let raws = stmt
                .query_map([owner.as_str()], RawUpload::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter()
                .map(|raw| raw.into_upload().map(|(_, upload)| upload))
                .collect()
        })
        .await
    }

    async fn delete_upload(&self, bucket: &BucketName, id: &UploadId) -> Result<()> {
        let bucket = bucket.clone();
        let id = *id;
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM uploads WHERE bucket = ? AND upload_id = ?",
                params![bucket.as_str(), id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_upload_buckets(&self) -> Result<Vec<BucketName>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT DISTINCT bucket FROM uploads ORDER BY bucket")?;
            let buckets = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|name| name.map(BucketName::new))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(buckets)
        })
        .await
    }

    async fn delete_upload_bucket(&self, bucket: &BucketName) -> Result<u64> {
        let bucket = bucket.clone();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM uploads WHERE bucket = ?", [bucket.as_str()])?;
            Ok(removed as u64)
        })
        .await
    }
}
