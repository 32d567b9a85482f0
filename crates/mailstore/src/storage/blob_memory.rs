//! In-memory blob storage
//!
//! Used by tests and by tools that do not need durability. Blobs are kept in
//! their encoded form so policy handling matches the file store.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::debug;
use sha2::{Digest, Sha256};

use super::blob::{BlobCodec, BlobStore, BucketName, ByteStream, StoragePolicy};
use crate::error::{Result, StoreError};
use crate::models::BlobId;

/// In-memory implementation of BlobStore
pub struct InMemoryBlobStore {
    default_bucket: BucketName,
    codec: BlobCodec,
    buckets: RwLock<HashMap<BucketName, HashMap<BlobId, Bytes>>>,
}

impl InMemoryBlobStore {
    /// Create an empty store whose default bucket is `default`
    pub fn new() -> Self {
        Self::with_codec(BucketName::new("default"), BlobCodec::default())
    }

    pub fn with_codec(default_bucket: BucketName, codec: BlobCodec) -> Self {
        Self {
            default_bucket,
            codec,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Number of blobs stored in a bucket
    pub fn blob_count(&self, bucket: &BucketName) -> usize {
        self.buckets
            .read()
            .map(|buckets| buckets.get(bucket).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn poisoned() -> StoreError {
        StoreError::Storage(anyhow!("in-memory blob store lock poisoned"))
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn default_bucket(&self) -> BucketName {
        self.default_bucket.clone()
    }

    async fn save(
        &self,
        bucket: &BucketName,
        data: Bytes,
        policy: StoragePolicy,
    ) -> Result<BlobId> {
        bucket.validate()?;
        let id = BlobId::of(&data);

        let mut buckets = self.buckets.write().map_err(|_| Self::poisoned())?;
        let blobs = buckets.entry(bucket.clone()).or_default();
        if blobs.contains_key(&id) {
            debug!("Blob {} already stored in {}", id, bucket);
            return Ok(id);
        }
        let encoded = self.codec.encode(&data, policy)?;
        blobs.insert(id.clone(), Bytes::from(encoded));
        Ok(id)
    }

    async fn save_stream(
        &self,
        bucket: &BucketName,
        data: ByteStream,
        policy: StoragePolicy,
    ) -> Result<BlobId> {
        let mut hasher = Sha256::new();
        let buffer = data
            .try_fold(BytesMut::new(), |mut buffer, chunk| {
                hasher.update(&chunk);
                buffer.extend_from_slice(&chunk);
                futures::future::ready(Ok(buffer))
            })
            .await?;

        let id = BlobId::from_hasher(hasher);
        let saved = self.save(bucket, buffer.freeze(), policy).await?;
        debug_assert_eq!(id, saved);
        Ok(saved)
    }

    async fn read_bytes(
        &self,
        bucket: &BucketName,
        id: &BlobId,
        _policy: StoragePolicy,
    ) -> Result<Bytes> {
        let stored = {
            let buckets = self.buckets.read().map_err(|_| Self::poisoned())?;
            buckets
                .get(bucket)
                .and_then(|blobs| blobs.get(id))
                .cloned()
                .ok_or_else(|| StoreError::not_found(format!("blob {} in bucket {}", id, bucket)))?
        };
        self.codec.decode(&stored)
    }

    fn list_buckets(&self) -> BoxStream<'static, Result<BucketName>> {
        let names: Result<Vec<BucketName>> = self
            .buckets
            .read()
            .map(|buckets| buckets.keys().cloned().collect())
            .map_err(|_| Self::poisoned());

        match names {
            Ok(names) => stream::iter(names.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(|_| Self::poisoned())?;
        buckets.remove(bucket);
        Ok(())
    }

    async fn delete(&self, bucket: &BucketName, id: &BlobId) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(|_| Self::poisoned())?;
        if let Some(blobs) = buckets.get_mut(bucket) {
            blobs.remove(id);
        }
        Ok(())
    }
}
