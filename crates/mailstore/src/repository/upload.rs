//! Upload repository: per-owner uploads partitioned into weekly buckets

use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::bucket::BucketNameGenerator;
use crate::error::{Result, StoreError};
use crate::models::{ContentType, Upload, UploadId, UploadMetadata, Username};
use crate::storage::{BlobStore, MetadataStore, StoragePolicy};

/// Ephemeral uploads, reclaimed wholesale by the retention sweep
#[derive(Clone)]
pub struct UploadRepository {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    buckets: BucketNameGenerator,
}

impl UploadRepository {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        buckets: BucketNameGenerator,
    ) -> Self {
        Self {
            blobs,
            metadata,
            buckets,
        }
    }

    /// Store content for `owner` in the bucket of the current week
    pub async fn upload(
        &self,
        content: Bytes,
        content_type: ContentType,
        owner: &Username,
    ) -> Result<UploadMetadata> {
        owner.validate()?;
        let uploaded_at = self.buckets.now();
        let bucket = self.buckets.bucket_for(uploaded_at).as_bucket_name();
        let size = content.len() as u64;

        let blob_id = self
            .blobs
            .save(&bucket, content, StoragePolicy::SizeBased)
            .await?;

        let upload = UploadMetadata {
            upload_id: UploadId::random(),
            owner: owner.clone(),
            blob_id,
            content_type,
            size,
            uploaded_at,
        };
        self.metadata.store_upload(&bucket, upload.clone()).await?;

        debug!("Stored upload {} for {} in {}", upload.upload_id, owner, bucket);
        Ok(upload)
    }

    /// Fetch an upload owned by `owner`
    ///
    /// A missing upload and one owned by someone else are indistinguishable.
    pub async fn retrieve(&self, upload_id: &UploadId, owner: &Username) -> Result<Upload> {
        owner.validate()?;
        let not_found = || {
            debug!("Upload {} not found for {}", upload_id, owner);
            StoreError::UploadNotFound(*upload_id)
        };

        let Some((bucket, metadata)) = self.metadata.find_upload(upload_id).await? else {
            return Err(not_found());
        };
        if &metadata.owner != owner {
            return Err(not_found());
        }

        let content = match self
            .blobs
            .read_bytes(&bucket, &metadata.blob_id, StoragePolicy::SizeBased)
            .await
        {
            Ok(content) => content,
            // Bucket swept between the row lookup and the read
            Err(e) if e.is_not_found() => return Err(not_found()),
            Err(e) => return Err(e),
        };

        Ok(Upload { metadata, content })
    }

    /// Uploads of `owner`, oldest first
    pub async fn list_uploads(&self, owner: &Username) -> Result<Vec<UploadMetadata>> {
        owner.validate()?;
        self.metadata.list_uploads(owner).await
    }

    /// Remove an upload row; unknown or foreign uploads are ignored
    pub async fn delete(&self, upload_id: &UploadId, owner: &Username) -> Result<()> {
        owner.validate()?;
        match self.metadata.find_upload(upload_id).await? {
            Some((bucket, metadata)) if &metadata.owner == owner => {
                self.metadata.delete_upload(&bucket, upload_id).await
            }
            _ => {
                debug!("Upload {} not deleted: not owned by {}", upload_id, owner);
                Ok(())
            }
        }
    }
}
