//! File-based blob storage with zstd compression

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::debug;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::blob::{BlobCodec, BlobStore, BucketName, ByteStream, StoragePolicy, decompress};
use crate::error::{Result, StoreError};
use crate::models::BlobId;

/// File-based blob storage
///
/// Directory structure:
/// ```text
/// blobs/
///   default/
///     Ab/
///       Ab12cd34...       # tag byte + raw or zstd payload
///   uploads-2652/
///     cd/
///       cd78ef90...
/// ```
///
/// Writes go to a uniquely named temporary file inside the bucket and are
/// renamed onto their content address, so concurrent saves of the same
/// content converge on one file.
pub struct FileBlobStore {
    root: PathBuf,
    default_bucket: BucketName,
    codec: BlobCodec,
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>, default_bucket: BucketName, codec: BlobCodec) -> Result<Self> {
        default_bucket.validate()?;
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).context("Failed to create blob storage directory")?;
        Ok(Self {
            root,
            default_bucket,
            codec,
        })
    }

    fn bucket_dir(&self, bucket: &BucketName) -> PathBuf {
        self.root.join(bucket.as_str())
    }

    /// Get the file path for a blob (sharded by the first 2 chars of the id)
    ///
    /// Both parts are checked so a path never leaves the storage root.
    fn blob_path(&self, bucket: &BucketName, id: &BlobId) -> Result<PathBuf> {
        bucket.validate()?;
        id.validate()?;
        let id = id.as_str();
        Ok(self.bucket_dir(bucket).join(&id[..2]).join(id))
    }

    fn temp_path(&self, bucket: &BucketName) -> PathBuf {
        self.bucket_dir(bucket)
            .join(format!(".tmp-{}", Uuid::new_v4().simple()))
    }

    /// Move a fully written temporary file onto its content address
    async fn commit(&self, temp: &Path, bucket: &BucketName, id: &BlobId) -> Result<()> {
        let path = self.blob_path(bucket, id)?;
        if fs::try_exists(&path).await? {
            debug!("Blob {} already stored in {}", id, bucket);
            fs::remove_file(temp).await?;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(temp, &path)
            .await
            .with_context(|| format!("Failed to move blob into {}", path.display()))?;
        Ok(())
    }

    async fn write_stream(&self, temp: &Path, mut data: ByteStream) -> Result<BlobId> {
        let mut file = fs::File::create(temp)
            .await
            .with_context(|| format!("Failed to create {}", temp.display()))?;
        let mut hasher = Sha256::new();

        file.write_all(&[BlobCodec::raw_tag()]).await?;
        while let Some(chunk) = data.try_next().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(BlobId::from_hasher(hasher))
    }

    async fn open(&self, bucket: &BucketName, id: &BlobId) -> Result<fs::File> {
        let path = self.blob_path(bucket, id)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::not_found(format!(
                "blob {} in bucket {}",
                id, bucket
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    fn default_bucket(&self) -> BucketName {
        self.default_bucket.clone()
    }

    async fn save(
        &self,
        bucket: &BucketName,
        data: Bytes,
        policy: StoragePolicy,
    ) -> Result<BlobId> {
        let id = BlobId::of(&data);
        // Lookup errors surface again from commit
        if matches!(fs::try_exists(self.blob_path(bucket, &id)?).await, Ok(true)) {
            debug!("Blob {} already stored in {}", id, bucket);
            return Ok(id);
        }

        let codec = self.codec;
        let encoded = if codec.compresses(policy, data.len()) {
            tokio::task::spawn_blocking(move || codec.encode(&data, policy)).await??
        } else {
            codec.encode(&data, policy)?
        };

        fs::create_dir_all(self.bucket_dir(bucket)).await?;
        let temp = self.temp_path(bucket);
        let written = match fs::write(&temp, &encoded).await {
            Ok(()) => self.commit(&temp, bucket, &id).await,
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to write {}", temp.display()))
                .into()),
        };
        discard_on_error(&temp, written).await?;
        Ok(id)
    }

    async fn save_stream(
        &self,
        bucket: &BucketName,
        data: ByteStream,
        policy: StoragePolicy,
    ) -> Result<BlobId> {
        bucket.validate()?;
        if policy == StoragePolicy::SizeBased {
            // Compression needs the whole payload to decide on the threshold
            let buffer = data
                .try_fold(BytesMut::new(), |mut buffer, chunk| {
                    buffer.extend_from_slice(&chunk);
                    futures::future::ready(Ok(buffer))
                })
                .await?;
            return self.save(bucket, buffer.freeze(), policy).await;
        }

        fs::create_dir_all(self.bucket_dir(bucket)).await?;
        let temp = self.temp_path(bucket);
        let id = discard_on_error(&temp, self.write_stream(&temp, data).await).await?;
        discard_on_error(&temp, self.commit(&temp, bucket, &id).await).await?;
        Ok(id)
    }

    async fn read_bytes(
        &self,
        bucket: &BucketName,
        id: &BlobId,
        _policy: StoragePolicy,
    ) -> Result<Bytes> {
        let mut file = self.open(bucket, id).await?;
        let mut stored = Vec::new();
        file.read_to_end(&mut stored).await?;

        let codec = self.codec;
        if stored.first().is_some_and(|tag| BlobCodec::is_raw_tag(*tag)) {
            return codec.decode(&stored);
        }
        tokio::task::spawn_blocking(move || codec.decode(&stored)).await?
    }

    async fn read_stream(
        &self,
        bucket: &BucketName,
        id: &BlobId,
        _policy: StoragePolicy,
    ) -> Result<ByteStream> {
        let mut file = self.open(bucket, id).await?;
        let tag = file.read_u8().await.context("Stored blob is empty")?;

        if BlobCodec::is_raw_tag(tag) {
            return Ok(ReaderStream::new(file).boxed());
        }

        let mut payload = Vec::new();
        file.read_to_end(&mut payload).await?;
        let data = tokio::task::spawn_blocking(move || decompress(&payload)).await??;
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    fn list_buckets(&self) -> BoxStream<'static, Result<BucketName>> {
        let root = self.root.clone();

        stream::once(async move { fs::read_dir(&root).await })
            .map(|read_dir| match read_dir {
                Ok(read_dir) => bucket_entries(read_dir).boxed(),
                Err(e) if e.kind() == ErrorKind::NotFound => stream::empty().boxed(),
                Err(e) => stream::once(async move { Err(StoreError::from(e)) }).boxed(),
            })
            .flatten()
            .boxed()
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<()> {
        bucket.validate()?;
        match fs::remove_dir_all(self.bucket_dir(bucket)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, bucket: &BucketName, id: &BlobId) -> Result<()> {
        match fs::remove_file(self.blob_path(bucket, id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Remove a temporary file left by a failed write
async fn discard_on_error<T>(temp: &Path, result: Result<T>) -> Result<T> {
    if result.is_err() {
        match fs::remove_file(temp).await {
            Ok(()) => debug!("Discarded {}", temp.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => debug!("Failed to discard {}: {}", temp.display(), e),
        }
    }
    result
}

/// Directories directly under the root are buckets
fn bucket_entries(read_dir: fs::ReadDir) -> BoxStream<'static, Result<BucketName>> {
    stream::try_unfold(read_dir, |mut read_dir| async move {
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                return Ok(Some((BucketName::new(name), read_dir)));
            }
        }
        Ok::<_, StoreError>(None)
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::chunked_stream;
    use crate::storage::testing::run_blob_store_conformance_tests;
    use tempfile::tempdir;

    fn create_test_store() -> (FileBlobStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(
            dir.path().join("blobs.test"),
            BucketName::new("default"),
            BlobCodec::new(64, 3),
        )
        .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_conformance() {
        let (store, _dir) = create_test_store();
        run_blob_store_conformance_tests(&store).await;
    }

    #[tokio::test]
    async fn test_compression_on_disk() {
        let (store, _dir) = create_test_store();
        let bucket = store.default_bucket();
        // Create a string that compresses well
        let data = "Hello, world! ".repeat(1000);

        let id = store
            .save(&bucket, Bytes::from(data.clone()), StoragePolicy::SizeBased)
            .await
            .unwrap();

        let path = store.blob_path(&bucket, &id).unwrap();
        let compressed_size = std::fs::metadata(path).unwrap().len();
        assert!(
            compressed_size < data.len() as u64,
            "Compressed size {} should be less than original {}",
            compressed_size,
            data.len()
        );

        let retrieved = store
            .read_bytes(&bucket, &id, StoragePolicy::SizeBased)
            .await
            .unwrap();
        assert_eq!(retrieved, data.as_bytes());
    }

    #[tokio::test]
    async fn test_streamed_save_stored_raw() {
        let (store, _dir) = create_test_store();
        let bucket = store.default_bucket();
        let data = Bytes::from("body line\r\n".repeat(500));

        let id = store
            .save_stream(&bucket, chunked_stream(data.clone(), 1000), StoragePolicy::LowCost)
            .await
            .unwrap();

        assert_eq!(id, BlobId::of(&data));
        let path = store.blob_path(&bucket, &id).unwrap();
        let on_disk = std::fs::metadata(path).unwrap().len();
        assert_eq!(on_disk, data.len() as u64 + 1);

        let chunks: Vec<Bytes> = store
            .read_stream(&bucket, &id, StoragePolicy::LowCost)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), data.to_vec());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (store, _dir) = create_test_store();
        let bucket = store.default_bucket();

        for _ in 0..3 {
            store
                .save_stream(
                    &bucket,
                    chunked_stream(Bytes::from_static(b"repeated"), 3),
                    StoragePolicy::LowCost,
                )
                .await
                .unwrap();
        }

        let leftovers = std::fs::read_dir(store.bucket_dir(&bucket))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_failed_stream_discards_temp_file() {
        let (store, _dir) = create_test_store();
        let bucket = store.default_bucket();
        let failing: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("producer went away")),
        ])
        .boxed();

        let result = store
            .save_stream(&bucket, failing, StoragePolicy::LowCost)
            .await;
        assert!(matches!(result, Err(StoreError::Storage(_))));

        let entries = std::fs::read_dir(store.bucket_dir(&bucket)).unwrap().count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn test_ids_cannot_escape_root() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"TOP SECRET").unwrap();
        let store = FileBlobStore::new(
            dir.path().join("blobs"),
            BucketName::new("default"),
            BlobCodec::default(),
        )
        .unwrap();
        let bucket = store.default_bucket();
        let escaping = BlobId::new("../../secret.txt");

        let read = store.read_bytes(&bucket, &escaping, StoragePolicy::LowCost).await;
        assert!(matches!(read, Err(StoreError::InvalidArgument(_))));
        let stream = store.read_stream(&bucket, &escaping, StoragePolicy::LowCost).await;
        assert!(matches!(stream, Err(StoreError::InvalidArgument(_))));
        let deleted = store.delete(&bucket, &escaping).await;
        assert!(matches!(deleted, Err(StoreError::InvalidArgument(_))));
        assert!(dir.path().join("secret.txt").exists());

        let id = BlobId::of(b"anything");
        let read = store
            .read_bytes(&BucketName::new(".."), &id, StoragePolicy::LowCost)
            .await;
        assert!(matches!(read, Err(StoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_discards_temp_file() {
        let (store, _dir) = create_test_store();
        let bucket = store.default_bucket();
        let data = Bytes::from_static(b"blocked by a file");
        let id = BlobId::of(&data);

        // A regular file where the shard directory should go makes the rename fail
        let bucket_dir = store.bucket_dir(&bucket);
        std::fs::create_dir_all(&bucket_dir).unwrap();
        std::fs::write(bucket_dir.join(&id.as_str()[..2]), b"not a directory").unwrap();

        let result = store.save(&bucket, data, StoragePolicy::LowCost).await;
        assert!(result.is_err());

        let leftovers = std::fs::read_dir(&bucket_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
