//! Metadata store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use super::blob::BucketName;
use crate::error::Result;
use crate::models::{
    AttachmentId, AttachmentRecord, AttachmentRef, BlobId, MessageId, Properties, UploadId,
    UploadMetadata, Username,
};

/// Persisted metadata of a message
///
/// Holds the addresses of the header and body blobs in the store's default
/// bucket, never the content itself.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub message_id: MessageId,
    pub internal_date: DateTime<Utc>,
    pub body_start_octet: usize,
    pub full_content_octets: u64,
    pub body_octets: u64,
    pub header_blob_id: BlobId,
    pub body_blob_id: BlobId,
    pub properties: Properties,
    /// Most recently added first
    pub attachments: Vec<AttachmentRef>,
}

/// Trait for metadata row operations
///
/// This trait abstracts over the row store backing the three logical tables:
/// messages keyed by message id, attachments keyed by attachment id, and
/// uploads keyed by `(bucket, upload id)`. Implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // === Messages ===

    /// Insert or update a message row
    ///
    /// Scalar columns are overwritten. `row.attachments` is prepended onto the
    /// stored list rather than replacing it; an empty list leaves the stored
    /// list untouched.
    async fn upsert_message(&self, row: MessageRow) -> Result<()>;

    /// Get a message row
    async fn get_message(&self, id: &MessageId) -> Result<Option<MessageRow>>;

    /// Delete a message row; deleting a missing row succeeds
    async fn delete_message(&self, id: &MessageId) -> Result<()>;

    /// Stream `(header, body)` blob ids of every message row
    fn list_message_blobs(&self) -> BoxStream<'static, Result<(BlobId, BlobId)>>;

    // === Attachments ===

    /// Insert or replace an attachment row
    async fn store_attachment(&self, record: AttachmentRecord) -> Result<()>;

    /// Get an attachment row
    async fn get_attachment(&self, id: &AttachmentId) -> Result<Option<AttachmentRecord>>;

    /// Set only the owning message of an existing attachment row
    ///
    /// Returns `false` when no row exists for `id`.
    async fn set_attachment_message_id(
        &self,
        id: &AttachmentId,
        message_id: &MessageId,
    ) -> Result<bool>;

    /// Delete an attachment row; deleting a missing row succeeds
    async fn delete_attachment(&self, id: &AttachmentId) -> Result<()>;

    /// Stream the blob id of every attachment row
    fn list_attachment_blobs(&self) -> BoxStream<'static, Result<BlobId>>;

    // === Uploads ===

    /// Insert an upload row under its bucket
    async fn store_upload(&self, bucket: &BucketName, upload: UploadMetadata) -> Result<()>;

    /// Find an upload row in whichever bucket holds it
    async fn find_upload(&self, id: &UploadId) -> Result<Option<(BucketName, UploadMetadata)>>;

    /// List the uploads of one owner, oldest first
    async fn list_uploads(&self, owner: &Username) -> Result<Vec<UploadMetadata>>;

    /// Delete one upload row
    async fn delete_upload(&self, bucket: &BucketName, id: &UploadId) -> Result<()>;

    /// Buckets that still hold at least one upload row
    async fn list_upload_buckets(&self) -> Result<Vec<BucketName>>;

    /// Delete every upload row of a bucket, returning how many were removed
    async fn delete_upload_bucket(&self, bucket: &BucketName) -> Result<u64>;
}

/// Prepend freshly saved attachment refs onto the stored history
pub(crate) fn prepend_attachments(
    new: Vec<AttachmentRef>,
    existing: Vec<AttachmentRef>,
) -> Vec<AttachmentRef> {
    let mut merged = new;
    merged.extend(existing);
    merged
}
