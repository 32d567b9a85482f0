//! Message repository: header/body split over the blob store

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::debug;

use crate::error::{Result, StoreError};
use crate::models::{BlobId, FetchType, MailMessage, MessageId, MessageRepresentation};
use crate::storage::{BlobStore, MessageRow, MetadataStore, StoragePolicy, chunked_stream};

/// Chunk size used when streaming a body into the blob store
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// Stores messages as a header blob, a body blob and a metadata row
#[derive(Clone)]
pub struct MessageRepository {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl MessageRepository {
    pub fn new(blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { blobs, metadata }
    }

    /// Save a message, returning the ids of its header and body blobs
    ///
    /// Both blobs are written concurrently. The metadata row is written only
    /// once both succeed, so a failed save never leaves a row pointing at
    /// missing content (orphan blobs are possible).
    pub async fn save(&self, message: &MailMessage) -> Result<(BlobId, BlobId)> {
        message.message_id.validate()?;
        if message.body_start_octet > message.content.len() {
            return Err(StoreError::invalid(format!(
                "body start {} is past the end of message {} ({} octets)",
                message.body_start_octet,
                message.message_id,
                message.content.len()
            )));
        }
        let bucket = self.blobs.default_bucket();

        let header = self
            .blobs
            .save(&bucket, message.header_content(), StoragePolicy::SizeBased);
        let body = self.blobs.save_stream(
            &bucket,
            chunked_stream(message.body_content(), BODY_CHUNK_SIZE),
            StoragePolicy::LowCost,
        );
        let (header_blob_id, body_blob_id) = futures::try_join!(header, body)?;

        self.metadata
            .upsert_message(MessageRow {
                message_id: message.message_id.clone(),
                internal_date: message.internal_date,
                body_start_octet: message.body_start_octet,
                full_content_octets: message.full_content_octets() as u64,
                body_octets: message.body_octets() as u64,
                header_blob_id: header_blob_id.clone(),
                body_blob_id: body_blob_id.clone(),
                properties: message.properties.clone(),
                attachments: message.attachments.clone(),
            })
            .await?;

        debug!(
            "Saved message {} (header {}, body {})",
            message.message_id, header_blob_id, body_blob_id
        );
        Ok((header_blob_id, body_blob_id))
    }

    /// Write the row of a message whose blobs are already stored
    ///
    /// Used when copying a message between stores that share a blob store.
    pub async fn save_representation(&self, representation: &MessageRepresentation) -> Result<()> {
        representation.message_id.validate()?;
        let body_octets = representation
            .size
            .saturating_sub(representation.body_start_octet as u64);

        self.metadata
            .upsert_message(MessageRow {
                message_id: representation.message_id.clone(),
                internal_date: representation.internal_date,
                body_start_octet: representation.body_start_octet,
                full_content_octets: representation.size,
                body_octets,
                header_blob_id: representation.header_id.clone(),
                body_blob_id: representation.body_id.clone(),
                properties: representation.properties.clone(),
                attachments: representation.attachments.clone(),
            })
            .await
    }

    /// Read a message back, materializing as much content as `fetch_type` asks
    pub async fn retrieve_message(
        &self,
        message_id: &MessageId,
        fetch_type: FetchType,
    ) -> Result<MessageRepresentation> {
        message_id.validate()?;
        let Some(row) = self.metadata.get_message(message_id).await? else {
            debug!("Message {} not found", message_id);
            return Err(StoreError::not_found(format!("message {}", message_id)));
        };

        let content = match fetch_type {
            FetchType::Metadata => Bytes::new(),
            FetchType::Headers => self.read_header(&row).await?,
            FetchType::Body => {
                let body = self.read_body(&row).await?;
                // Offsets stay valid against the full message
                let mut padded = BytesMut::zeroed(row.body_start_octet);
                padded.extend_from_slice(&body);
                padded.freeze()
            }
            FetchType::Full => {
                let (header, body) =
                    futures::try_join!(self.read_header(&row), self.read_body(&row))?;
                let mut full = BytesMut::with_capacity(header.len() + body.len());
                full.extend_from_slice(&header);
                full.extend_from_slice(&body);
                full.freeze()
            }
        };

        Ok(MessageRepresentation {
            message_id: row.message_id,
            internal_date: row.internal_date,
            size: row.full_content_octets,
            body_start_octet: row.body_start_octet,
            content,
            properties: row.properties,
            attachments: row.attachments,
            header_id: row.header_blob_id,
            body_id: row.body_blob_id,
        })
    }

    /// Remove the metadata row; blobs are left in place
    pub async fn delete(&self, message_id: &MessageId) -> Result<()> {
        message_id.validate()?;
        self.metadata.delete_message(message_id).await
    }

    /// Every header and body blob id referenced by a message row
    pub fn list_blobs(&self) -> BoxStream<'static, Result<BlobId>> {
        self.metadata
            .list_message_blobs()
            .map_ok(|(header, body)| stream::iter([Ok(header), Ok(body)]))
            .try_flatten()
            .boxed()
    }

    async fn read_header(&self, row: &MessageRow) -> Result<Bytes> {
        self.blobs
            .read_bytes(
                &self.blobs.default_bucket(),
                &row.header_blob_id,
                StoragePolicy::SizeBased,
            )
            .await
    }

    async fn read_body(&self, row: &MessageRow) -> Result<Bytes> {
        let stream = self
            .blobs
            .read_stream(
                &self.blobs.default_bucket(),
                &row.body_blob_id,
                StoragePolicy::LowCost,
            )
            .await?;
        let body = stream
            .try_fold(
                BytesMut::with_capacity(row.body_octets as usize),
                |mut body, chunk| async move {
                    body.extend_from_slice(&chunk);
                    Ok(body)
                },
            )
            .await?;
        Ok(body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachmentId, AttachmentRef, Cid, Properties};
    use crate::storage::{InMemoryBlobStore, InMemoryMetadataStore};
    use chrono::{TimeZone, Utc};

    const RAW: &[u8] = b"Subject: Quarterly report\r\nFrom: alice@example.com\r\n\r\nNumbers attached.\r\n";

    fn repository() -> (MessageRepository, Arc<InMemoryBlobStore>) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let repository =
            MessageRepository::new(blobs.clone(), Arc::new(InMemoryMetadataStore::new()));
        (repository, blobs)
    }

    fn message(id: &str) -> MailMessage {
        let mut message = MailMessage::from_raw(MessageId::new(id), RAW);
        message.internal_date = Utc.with_ymd_and_hms(2020, 10, 30, 14, 12, 0).unwrap();
        message
    }

    #[tokio::test]
    async fn test_full_round_trip() {
        let (repository, _) = repository();
        let message = message("m1");
        let (header_id, body_id) = repository.save(&message).await.unwrap();

        let full = repository
            .retrieve_message(&message.message_id, FetchType::Full)
            .await
            .unwrap();

        assert_eq!(&full.content[..], RAW);
        assert_eq!(full.size, RAW.len() as u64);
        assert_eq!(full.header_id, header_id);
        assert_eq!(full.body_id, body_id);
        assert_eq!(full.internal_date, message.internal_date);
        assert_eq!(full.properties.textual_line_count, Some(1));
        assert!(full.attachments.is_empty());
    }

    #[tokio::test]
    async fn test_body_start_past_content_rejected() {
        let (repository, blobs) = repository();
        let mut message = message("m1");
        message.body_start_octet = RAW.len() + 100;

        let result = repository.save(&message).await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert_eq!(blobs.blob_count(&blobs.default_bucket()), 0);
        assert!(
            repository
                .retrieve_message(&message.message_id, FetchType::Metadata)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_fetch_types() {
        let (repository, _) = repository();
        let message = message("m1");
        repository.save(&message).await.unwrap();
        let offset = message.body_start_octet;

        let headers = repository
            .retrieve_message(&message.message_id, FetchType::Headers)
            .await
            .unwrap();
        assert_eq!(&headers.content[..], &RAW[..offset]);

        let body = repository
            .retrieve_message(&message.message_id, FetchType::Body)
            .await
            .unwrap();
        assert_eq!(body.content.len(), RAW.len());
        assert!(body.content[..offset].iter().all(|b| *b == 0));
        assert_eq!(&body.content[offset..], &RAW[offset..]);

        let metadata = repository
            .retrieve_message(&message.message_id, FetchType::Metadata)
            .await
            .unwrap();
        assert!(metadata.content.is_empty());
        assert_eq!(metadata.body_start_octet, offset);
        assert_eq!(metadata.size, RAW.len() as u64);
    }

    #[tokio::test]
    async fn test_identical_messages_share_blobs() {
        let (repository, blobs) = repository();

        let first = repository.save(&message("m1")).await.unwrap();
        let second = repository.save(&message("m2")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(blobs.blob_count(&blobs.default_bucket()), 2);
    }

    #[tokio::test]
    async fn test_attachments_prepend_across_saves() {
        let (repository, _) = repository();
        let a1 = AttachmentRef::new(AttachmentId::new("a1")).named("q3.xlsx");
        let a2 = AttachmentRef::new(AttachmentId::new("a2"))
            .inline(Cid::parse("<chart@example>").unwrap());

        let mut first = message("m1");
        first.attachments = vec![a1.clone()];
        repository.save(&first).await.unwrap();

        let mut second = message("m1");
        second.attachments = vec![a2.clone()];
        repository.save(&second).await.unwrap();

        // Saving without attachments keeps the list
        repository.save(&message("m1")).await.unwrap();

        let stored = repository
            .retrieve_message(&MessageId::new("m1"), FetchType::Metadata)
            .await
            .unwrap();
        assert_eq!(stored.attachments, vec![a2, a1]);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let (repository, _) = repository();
        let raw = b"Subject: no body\r\n\r\n";
        let message = MailMessage::from_raw(MessageId::new("m1"), &raw[..]);
        repository.save(&message).await.unwrap();

        let full = repository
            .retrieve_message(&message.message_id, FetchType::Full)
            .await
            .unwrap();
        assert_eq!(&full.content[..], raw);
    }

    #[tokio::test]
    async fn test_missing_message_is_not_found() {
        let (repository, _) = repository();
        let err = repository
            .retrieve_message(&MessageId::new("nope"), FetchType::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_blank_id_rejected_before_io() {
        let (repository, blobs) = repository();
        let message = MailMessage::from_raw(MessageId::new(" "), RAW);

        let err = repository.save(&message).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert_eq!(blobs.blob_count(&blobs.default_bucket()), 0);
    }

    #[tokio::test]
    async fn test_save_representation_copies_row() {
        let (repository, _) = repository();
        let message = message("m1");
        repository.save(&message).await.unwrap();

        let mut copy = repository
            .retrieve_message(&message.message_id, FetchType::Metadata)
            .await
            .unwrap();
        copy.message_id = MessageId::new("m1-copy");
        copy.attachments = Vec::new();
        repository.save_representation(&copy).await.unwrap();

        let full = repository
            .retrieve_message(&MessageId::new("m1-copy"), FetchType::Full)
            .await
            .unwrap();
        assert_eq!(&full.content[..], RAW);
    }

    #[tokio::test]
    async fn test_delete_keeps_blobs() {
        let (repository, blobs) = repository();
        let message = message("m1");
        let (header_id, _) = repository.save(&message).await.unwrap();

        repository.delete(&message.message_id).await.unwrap();

        assert!(
            repository
                .retrieve_message(&message.message_id, FetchType::Metadata)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            blobs
                .read_bytes(&blobs.default_bucket(), &header_id, StoragePolicy::SizeBased)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_list_blobs() {
        let (repository, _) = repository();
        let (header_id, body_id) = repository.save(&message("m1")).await.unwrap();

        let ids: Vec<BlobId> = repository.list_blobs().try_collect().await.unwrap();
        assert_eq!(ids, vec![header_id, body_id]);
    }

    #[tokio::test]
    async fn test_properties_are_kept() {
        let (repository, _) = repository();
        let mut properties = Properties::with_media_type("multipart", "mixed");
        properties
            .content_type_parameters
            .insert("boundary".to_string(), "xyz".to_string());
        properties.content_language = vec!["en".to_string(), "fr".to_string()];

        let mut message = message("m1");
        message.properties = properties.clone();
        repository.save(&message).await.unwrap();

        let stored = repository
            .retrieve_message(&message.message_id, FetchType::Metadata)
            .await
            .unwrap();
        assert_eq!(stored.properties, properties);
    }
}
