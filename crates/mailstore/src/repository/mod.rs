//! Repositories over the blob and metadata stores
//!
//! Producers go through these; none of them touch blob storage directly.

mod attachment;
mod message;
mod upload;

use std::sync::Arc;

use anyhow::Context;
use log::info;

pub use attachment::AttachmentRepository;
pub use message::{BODY_CHUNK_SIZE, MessageRepository};
pub use upload::UploadRepository;

use crate::bucket::BucketNameGenerator;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::storage::{
    BlobStore, FileBlobStore, InMemoryBlobStore, InMemoryMetadataStore, MetadataStore,
    SqliteMetadataStore,
};

/// The stores and every repository built on them
#[derive(Clone)]
pub struct Repositories {
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub buckets: BucketNameGenerator,
    pub messages: MessageRepository,
    pub attachments: AttachmentRepository,
    pub uploads: UploadRepository,
}

impl Repositories {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        buckets: BucketNameGenerator,
    ) -> Self {
        Self {
            messages: MessageRepository::new(blobs.clone(), metadata.clone()),
            attachments: AttachmentRepository::new(blobs.clone(), metadata.clone()),
            uploads: UploadRepository::new(blobs.clone(), metadata.clone(), buckets.clone()),
            blobs,
            metadata,
            buckets,
        }
    }

    /// Durable stores under `config.data_dir`
    pub fn open(config: &StoreConfig, buckets: BucketNameGenerator) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {:?}", config.data_dir)
        })?;

        let blobs = FileBlobStore::new(config.blob_dir(), config.default_bucket(), config.codec())?;
        let metadata = SqliteMetadataStore::new(config.database_path())?
            .with_page_size(config.page_size);

        info!("Opened mail store at {:?}", config.data_dir);
        Ok(Self::new(Arc::new(blobs), Arc::new(metadata), buckets))
    }

    /// Volatile stores, for tests and dry runs
    pub fn in_memory(buckets: BucketNameGenerator) -> Self {
        Self::new(
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryMetadataStore::new()),
            buckets,
        )
    }
}
