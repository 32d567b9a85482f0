//! Attachment repository

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use log::debug;

use crate::error::{Result, StoreError};
use crate::models::{Attachment, AttachmentId, AttachmentRecord, BlobId, ContentType, MessageId};
use crate::storage::{BlobStore, MetadataStore, StoragePolicy};

/// Attachment metadata, stored independently of message rows
#[derive(Clone)]
pub struct AttachmentRepository {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl AttachmentRepository {
    pub fn new(blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { blobs, metadata }
    }

    /// Load an attachment, resolving a missing owner through `fallback`
    ///
    /// `fallback` is only polled when the row has no message id.
    pub async fn get_attachment<F, Fut>(&self, id: &AttachmentId, fallback: F) -> Result<Attachment>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MessageId>>,
    {
        id.validate()?;
        let record = self.find(id).await?;

        let message_id = match record.message_id.clone() {
            Some(message_id) => message_id,
            None => {
                debug!("Attachment {} has no owner, using fallback", id);
                fallback().await?
            }
        };
        Ok(Attachment::from_record(record, message_id))
    }

    pub async fn store_attachment(&self, record: AttachmentRecord) -> Result<()> {
        record.attachment_id.validate()?;
        record.blob_id.validate()?;
        if let Some(message_id) = &record.message_id {
            message_id.validate()?;
        }
        self.metadata.store_attachment(record).await
    }

    /// Record the owning message of an existing attachment
    ///
    /// Only the owner column changes. A missing row is left missing.
    pub async fn insert_message_id(&self, id: &AttachmentId, message_id: &MessageId) -> Result<()> {
        id.validate()?;
        message_id.validate()?;
        if !self.metadata.set_attachment_message_id(id, message_id).await? {
            debug!("Attachment {} not found, owner {} not recorded", id, message_id);
        }
        Ok(())
    }

    /// Remove the attachment row; the blob is left in place
    pub async fn delete(&self, id: &AttachmentId) -> Result<()> {
        id.validate()?;
        self.metadata.delete_attachment(id).await
    }

    /// Blob ids referenced by attachment rows
    pub fn list_blobs(&self) -> BoxStream<'static, Result<BlobId>> {
        self.metadata.list_attachment_blobs()
    }

    /// Store attachment bytes and their row under a fresh id
    pub async fn store_content(
        &self,
        content: Bytes,
        content_type: ContentType,
        message_id: Option<MessageId>,
    ) -> Result<AttachmentRecord> {
        if let Some(message_id) = &message_id {
            message_id.validate()?;
        }
        let size = content.len() as u64;
        let blob_id = self
            .blobs
            .save(&self.blobs.default_bucket(), content, StoragePolicy::LowCost)
            .await?;

        let record = AttachmentRecord {
            attachment_id: AttachmentId::random(),
            message_id,
            blob_id,
            content_type,
            size,
        };
        self.metadata.store_attachment(record.clone()).await?;
        Ok(record)
    }

    /// Read the bytes of a stored attachment
    pub async fn read_content(&self, id: &AttachmentId) -> Result<Bytes> {
        id.validate()?;
        let record = self.find(id).await?;
        self.blobs
            .read_bytes(
                &self.blobs.default_bucket(),
                &record.blob_id,
                StoragePolicy::LowCost,
            )
            .await
    }

    async fn find(&self, id: &AttachmentId) -> Result<AttachmentRecord> {
        match self.metadata.get_attachment(id).await? {
            Some(record) => Ok(record),
            None => {
                debug!("Attachment {} not found", id);
                Err(StoreError::not_found(format!("attachment {}", id)))
            }
        }
    }
}
