//! Blob storage trait for content-addressed mail content
//!
//! Blobs are addressed by `(bucket, BlobId)` where the id is derived from the
//! bytes themselves. Saving the same bytes twice lands on the same address, so
//! deduplication needs no coordination between writers.

use std::fmt;
use std::io::Read;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::models::BlobId;

/// A lazily produced sequence of byte chunks
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Tag byte prepended to stored blobs holding raw bytes
const RAW_TAG: u8 = 0;
/// Tag byte prepended to stored blobs holding zstd frames
const ZSTD_TAG: u8 = 1;

/// Name of a blob namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketName(pub String);

impl BucketName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bucket names double as directory names, so keep them to a safe alphabet
    pub fn validate(&self) -> Result<()> {
        let name = self.0.as_str();
        let safe = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if name.is_empty() || name == "." || name == ".." || name.starts_with('.') || !safe {
            return Err(StoreError::invalid(format!("invalid bucket name '{}'", name)));
        }
        Ok(())
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BucketName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a blob's bytes are encoded at rest
///
/// The policy never influences the blob id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoragePolicy {
    /// Compress when the content is larger than the configured threshold
    SizeBased,
    /// Store as-is; suited to large payloads that are streamed
    LowCost,
}

/// Encodes blobs according to their storage policy
#[derive(Debug, Clone, Copy)]
pub struct BlobCodec {
    compression_threshold: usize,
    compression_level: i32,
}

impl Default for BlobCodec {
    fn default() -> Self {
        Self {
            compression_threshold: 4 * 1024,
            compression_level: 3, // Good balance of speed vs compression
        }
    }
}

impl BlobCodec {
    pub fn new(compression_threshold: usize, compression_level: i32) -> Self {
        Self {
            compression_threshold,
            compression_level,
        }
    }

    /// Whether content of `len` bytes gets compressed under `policy`
    pub fn compresses(&self, policy: StoragePolicy, len: usize) -> bool {
        policy == StoragePolicy::SizeBased && len > self.compression_threshold
    }

    /// Encode content into its stored form (tag byte followed by payload)
    pub fn encode(&self, data: &[u8], policy: StoragePolicy) -> Result<Vec<u8>> {
        if self.compresses(policy, data.len()) {
            let mut out = vec![ZSTD_TAG];
            let compressed = zstd::encode_all(data, self.compression_level)
                .context("Failed to compress blob")?;
            out.extend_from_slice(&compressed);
            return Ok(out);
        }
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(RAW_TAG);
        out.extend_from_slice(data);
        Ok(out)
    }

    /// Decode a stored blob back into its content
    pub fn decode(&self, stored: &[u8]) -> Result<Bytes> {
        match stored.split_first() {
            Some((&RAW_TAG, payload)) => Ok(Bytes::copy_from_slice(payload)),
            Some((&ZSTD_TAG, payload)) => decompress(payload),
            Some((tag, _)) => Err(anyhow::anyhow!("Unknown blob encoding tag {}", tag).into()),
            None => Err(anyhow::anyhow!("Stored blob is empty").into()),
        }
    }

    /// Tag byte for content written through the streaming path
    pub(crate) fn raw_tag() -> u8 {
        RAW_TAG
    }

    pub(crate) fn is_raw_tag(tag: u8) -> bool {
        tag == RAW_TAG
    }
}

pub(crate) fn decompress(payload: &[u8]) -> Result<Bytes> {
    let mut decoder = zstd::Decoder::new(payload).context("Failed to open zstd frame")?;
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .context("Failed to decompress blob")?;
    Ok(Bytes::from(decompressed))
}

/// Wrap an in-memory payload as a single-chunk stream
pub fn once_stream(data: Bytes) -> ByteStream {
    stream::once(async move { Ok(data) }).boxed()
}

/// Split an in-memory payload into a lazily yielded chunk stream
pub fn chunked_stream(data: Bytes, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let chunks = (0..data.len())
        .step_by(chunk_size)
        .map(move |start| Ok(data.slice(start..(start + chunk_size).min(data.len()))));
    stream::iter(chunks.collect::<Vec<_>>()).boxed()
}

/// Content-addressed blob storage
///
/// Implementations handle policy encoding internally. Reads of a missing
/// blob fail with [`StoreError::NotFound`]; I/O failures surface as
/// [`StoreError::Storage`] and are not retried.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket used by callers that are not time-partitioned
    fn default_bucket(&self) -> BucketName;

    /// Store an in-memory payload, returning its content-derived id
    async fn save(&self, bucket: &BucketName, data: Bytes, policy: StoragePolicy)
    -> Result<BlobId>;

    /// Store a lazily produced payload, returning its content-derived id
    async fn save_stream(
        &self,
        bucket: &BucketName,
        data: ByteStream,
        policy: StoragePolicy,
    ) -> Result<BlobId>;

    /// Read a blob fully into memory
    async fn read_bytes(
        &self,
        bucket: &BucketName,
        id: &BlobId,
        policy: StoragePolicy,
    ) -> Result<Bytes>;

    /// Read a blob as a stream of chunks
    async fn read_stream(
        &self,
        bucket: &BucketName,
        id: &BlobId,
        policy: StoragePolicy,
    ) -> Result<ByteStream> {
        let data = self.read_bytes(bucket, id, policy).await?;
        Ok(once_stream(data))
    }

    /// Enumerate every bucket holding at least one blob
    fn list_buckets(&self) -> BoxStream<'static, Result<BucketName>>;

    /// Delete a bucket and all its blobs; deleting a missing bucket succeeds
    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()>;

    /// Delete a single blob; deleting a missing blob succeeds
    async fn delete(&self, bucket: &BucketName, id: &BlobId) -> Result<()>;
}
