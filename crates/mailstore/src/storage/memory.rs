//! In-memory metadata storage implementation

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::blob::BucketName;
use super::traits::{MessageRow, MetadataStore, prepend_attachments};
use crate::error::{Result, StoreError};
use crate::models::{
    AttachmentId, AttachmentRecord, BlobId, MessageId, UploadId, UploadMetadata, Username,
};

/// In-memory implementation of MetadataStore
///
/// Uses RwLock for thread-safe concurrent access.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    messages: RwLock<HashMap<MessageId, MessageRow>>,
    attachments: RwLock<HashMap<AttachmentId, AttachmentRecord>>,
    uploads: RwLock<HashMap<BucketName, HashMap<UploadId, UploadMetadata>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StoreError::Storage(anyhow!("in-memory metadata lock poisoned")))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StoreError::Storage(anyhow!("in-memory metadata lock poisoned")))
}

fn snapshot<T: Send + 'static>(items: Result<Vec<T>>) -> BoxStream<'static, Result<T>> {
    match items {
        Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(async move { Err(e) }).boxed(),
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn upsert_message(&self, mut row: MessageRow) -> Result<()> {
        let mut messages = write(&self.messages)?;
        if let Some(existing) = messages.remove(&row.message_id) {
            row.attachments = prepend_attachments(row.attachments, existing.attachments);
        }
        messages.insert(row.message_id.clone(), row);
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> Result<Option<MessageRow>> {
        Ok(read(&self.messages)?.get(id).cloned())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<()> {
        write(&self.messages)?.remove(id);
        Ok(())
    }

    fn list_message_blobs(&self) -> BoxStream<'static, Result<(BlobId, BlobId)>> {
        snapshot(read(&self.messages).map(|messages| {
            messages
                .values()
                .map(|row| (row.header_blob_id.clone(), row.body_blob_id.clone()))
                .collect()
        }))
    }

    async fn store_attachment(&self, record: AttachmentRecord) -> Result<()> {
        write(&self.attachments)?.insert(record.attachment_id.clone(), record);
        Ok(())
    }

    async fn get_attachment(&self, id: &AttachmentId) -> Result<Option<AttachmentRecord>> {
        Ok(read(&self.attachments)?.get(id).cloned())
    }

    async fn set_attachment_message_id(
        &self,
        id: &AttachmentId,
        message_id: &MessageId,
    ) -> Result<bool> {
        let mut attachments = write(&self.attachments)?;
        match attachments.get_mut(id) {
            Some(record) => {
                record.message_id = Some(message_id.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_attachment(&self, id: &AttachmentId) -> Result<()> {
        write(&self.attachments)?.remove(id);
        Ok(())
    }

    fn list_attachment_blobs(&self) -> BoxStream<'static, Result<BlobId>> {
        snapshot(read(&self.attachments).map(|attachments| {
            attachments
                .values()
                .map(|record| record.blob_id.clone())
                .collect()
        }))
    }

    async fn store_upload(&self, bucket: &BucketName, upload: UploadMetadata) -> Result<()> {
        write(&self.uploads)?
            .entry(bucket.clone())
            .or_default()
            .insert(upload.upload_id, upload);
        Ok(())
    }

    async fn find_upload(&self, id: &UploadId) -> Result<Option<(BucketName, UploadMetadata)>> {
        let uploads = read(&self.uploads)?;
        Ok(uploads.iter().find_map(|(bucket, rows)| {
            rows.get(id).map(|upload| (bucket.clone(), upload.clone()))
        }))
    }

    async fn list_uploads(&self, owner: &Username) -> Result<Vec<UploadMetadata>> {
        let uploads = read(&self.uploads)?;
        let mut owned: Vec<UploadMetadata> = uploads
            .values()
            .flat_map(|rows| rows.values())
            .filter(|upload| &upload.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.upload_id.0.cmp(&b.upload_id.0))
        });
        Ok(owned)
    }

    async fn delete_upload(&self, bucket: &BucketName, id: &UploadId) -> Result<()> {
        let mut uploads = write(&self.uploads)?;
        if let Some(rows) = uploads.get_mut(bucket) {
            rows.remove(id);
            if rows.is_empty() {
                uploads.remove(bucket);
            }
        }
        Ok(())
    }

    async fn list_upload_buckets(&self) -> Result<Vec<BucketName>> {
        let uploads = read(&self.uploads)?;
        let mut buckets: Vec<BucketName> = uploads
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(bucket, _)| bucket.clone())
            .collect();
        buckets.sort();
        Ok(buckets)
    }

    async fn delete_upload_bucket(&self, bucket: &BucketName) -> Result<u64> {
        let removed = write(&self.uploads)?.remove(bucket);
        Ok(removed.map_or(0, |rows| rows.len() as u64))
    }
}
