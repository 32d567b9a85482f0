//! Conformance suites shared by every store implementation

use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::TryStreamExt;

use super::blob::{BlobStore, BucketName, StoragePolicy, chunked_stream};
use super::traits::{MessageRow, MetadataStore};
use crate::error::StoreError;
use crate::models::{
    AttachmentId, AttachmentRecord, AttachmentRef, BlobId, ContentType, MessageId, Properties,
    UploadId, UploadMetadata, Username,
};

/// Run the full blob store conformance suite
pub async fn run_blob_store_conformance_tests(store: &dyn BlobStore) {
    test_blob_save_and_read(store).await;
    test_blob_ids_are_content_derived(store).await;
    test_blob_stream_save(store).await;
    test_blob_missing_is_not_found(store).await;
    test_blob_buckets(store).await;
    test_blob_delete_is_idempotent(store).await;
    test_blob_empty_payload(store).await;
}

async fn test_blob_save_and_read(store: &dyn BlobStore) {
    let bucket = store.default_bucket();
    let small = Bytes::from_static(b"Subject: conformance\r\n\r\n");
    let large = Bytes::from("Lorem ipsum dolor sit amet. ".repeat(1000));

    for policy in [StoragePolicy::SizeBased, StoragePolicy::LowCost] {
        for data in [&small, &large] {
            let id = store.save(&bucket, data.clone(), policy).await.unwrap();
            let read = store.read_bytes(&bucket, &id, policy).await.unwrap();
            assert_eq!(&read, data);

            let streamed: Vec<Bytes> = store
                .read_stream(&bucket, &id, policy)
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            assert_eq!(streamed.concat(), data.to_vec());
        }
    }
}

async fn test_blob_ids_are_content_derived(store: &dyn BlobStore) {
    let bucket = store.default_bucket();
    let data = Bytes::from_static(b"same bytes, any policy");

    let a = store
        .save(&bucket, data.clone(), StoragePolicy::SizeBased)
        .await
        .unwrap();
    let b = store
        .save(&bucket, data.clone(), StoragePolicy::LowCost)
        .await
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(a, BlobId::of(&data));
}

async fn test_blob_stream_save(store: &dyn BlobStore) {
    let bucket = BucketName::new("conformance-stream");
    let data = Bytes::from("streamed body line\r\n".repeat(500));

    for policy in [StoragePolicy::SizeBased, StoragePolicy::LowCost] {
        let id = store
            .save_stream(&bucket, chunked_stream(data.clone(), 1000), policy)
            .await
            .unwrap();
        assert_eq!(id, BlobId::of(&data));
        assert_eq!(store.read_bytes(&bucket, &id, policy).await.unwrap(), data);
    }

    store.delete_bucket(&bucket).await.unwrap();
}

async fn test_blob_missing_is_not_found(store: &dyn BlobStore) {
    let bucket = store.default_bucket();
    let missing = BlobId::of(b"never stored in conformance");

    let err = store
        .read_bytes(&bucket, &missing, StoragePolicy::LowCost)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    let err = store
        .read_bytes(
            &BucketName::new("conformance-missing-bucket"),
            &missing,
            StoragePolicy::LowCost,
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

async fn test_blob_buckets(store: &dyn BlobStore) {
    let a = BucketName::new("conformance-a");
    let b = BucketName::new("conformance-b");
    let id_a = store
        .save(&a, Bytes::from_static(b"in a"), StoragePolicy::LowCost)
        .await
        .unwrap();
    let id_b = store
        .save(&b, Bytes::from_static(b"in b"), StoragePolicy::LowCost)
        .await
        .unwrap();

    let buckets: Vec<BucketName> = store.list_buckets().try_collect().await.unwrap();
    assert!(buckets.contains(&a));
    assert!(buckets.contains(&b));

    store.delete_bucket(&a).await.unwrap();

    let buckets: Vec<BucketName> = store.list_buckets().try_collect().await.unwrap();
    assert!(!buckets.contains(&a));
    assert!(buckets.contains(&b));
    assert!(
        store
            .read_bytes(&a, &id_a, StoragePolicy::LowCost)
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert_eq!(
        store
            .read_bytes(&b, &id_b, StoragePolicy::LowCost)
            .await
            .unwrap(),
        Bytes::from_static(b"in b")
    );

    // Deleting twice is fine
    store.delete_bucket(&a).await.unwrap();
    store.delete_bucket(&b).await.unwrap();
}

async fn test_blob_delete_is_idempotent(store: &dyn BlobStore) {
    let bucket = store.default_bucket();
    let id = store
        .save(
            &bucket,
            Bytes::from_static(b"to be deleted"),
            StoragePolicy::LowCost,
        )
        .await
        .unwrap();

    store.delete(&bucket, &id).await.unwrap();
    store.delete(&bucket, &id).await.unwrap();

    assert!(
        store
            .read_bytes(&bucket, &id, StoragePolicy::LowCost)
            .await
            .unwrap_err()
            .is_not_found()
    );
}

async fn test_blob_empty_payload(store: &dyn BlobStore) {
    let bucket = store.default_bucket();
    let id = store
        .save(&bucket, Bytes::new(), StoragePolicy::SizeBased)
        .await
        .unwrap();
    assert!(
        store
            .read_bytes(&bucket, &id, StoragePolicy::SizeBased)
            .await
            .unwrap()
            .is_empty()
    );
}

/// Run the full metadata store conformance suite
pub async fn run_metadata_store_conformance_tests(store: &dyn MetadataStore) {
    test_message_crud(store).await;
    test_message_attachments_are_prepended(store).await;
    test_message_blob_listing(store).await;
    test_attachment_crud(store).await;
    test_attachment_message_id_update(store).await;
    test_upload_rows(store).await;
    test_upload_buckets(store).await;
}

fn message_row(id: &str, attachments: Vec<AttachmentRef>) -> MessageRow {
    MessageRow {
        message_id: MessageId::new(id),
        internal_date: Utc::now(),
        body_start_octet: 18,
        full_content_octets: 42,
        body_octets: 24,
        header_blob_id: BlobId::of(format!("header of {}", id).as_bytes()),
        body_blob_id: BlobId::of(format!("body of {}", id).as_bytes()),
        properties: Properties::with_media_type("text", "plain"),
        attachments,
    }
}

fn upload(owner: &str, minutes_ago: i64) -> UploadMetadata {
    UploadMetadata {
        upload_id: UploadId::random(),
        owner: Username::new(owner),
        blob_id: BlobId::of(format!("upload by {} {}", owner, minutes_ago).as_bytes()),
        content_type: ContentType::new("image/png"),
        size: 128,
        uploaded_at: Utc::now() - Duration::minutes(minutes_ago),
    }
}

async fn test_message_crud(store: &dyn MetadataStore) {
    let row = message_row("crud-1", Vec::new());
    store.upsert_message(row.clone()).await.unwrap();

    let fetched = store.get_message(&row.message_id).await.unwrap().unwrap();
    assert_eq!(fetched.header_blob_id, row.header_blob_id);
    assert_eq!(fetched.body_start_octet, 18);
    assert_eq!(fetched.properties.media_type.as_deref(), Some("text"));
    assert_eq!(
        fetched.internal_date.timestamp_micros(),
        row.internal_date.timestamp_micros()
    );

    store.delete_message(&row.message_id).await.unwrap();
    assert!(store.get_message(&row.message_id).await.unwrap().is_none());
    store.delete_message(&row.message_id).await.unwrap();
    assert!(
        store
            .get_message(&MessageId::new("never-saved"))
            .await
            .unwrap()
            .is_none()
    );
}

async fn test_message_attachments_are_prepended(store: &dyn MetadataStore) {
    let first = AttachmentRef::new(AttachmentId::new("prepend-a1"));
    let second = AttachmentRef::new(AttachmentId::new("prepend-a2")).named("report.pdf");

    store
        .upsert_message(message_row("prepend-1", vec![first.clone()]))
        .await
        .unwrap();
    store
        .upsert_message(message_row("prepend-1", vec![second.clone()]))
        .await
        .unwrap();
    // An empty list leaves the stored list untouched
    store
        .upsert_message(message_row("prepend-1", Vec::new()))
        .await
        .unwrap();

    let fetched = store
        .get_message(&MessageId::new("prepend-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.attachments, vec![second, first]);

    store
        .delete_message(&MessageId::new("prepend-1"))
        .await
        .unwrap();
}

async fn test_message_blob_listing(store: &dyn MetadataStore) {
    let rows: Vec<MessageRow> = (0..5)
        .map(|i| message_row(&format!("listing-{}", i), Vec::new()))
        .collect();
    for row in &rows {
        store.upsert_message(row.clone()).await.unwrap();
    }

    let blobs: Vec<(BlobId, BlobId)> = store.list_message_blobs().try_collect().await.unwrap();
    for row in &rows {
        assert!(blobs.contains(&(row.header_blob_id.clone(), row.body_blob_id.clone())));
    }

    for row in &rows {
        store.delete_message(&row.message_id).await.unwrap();
    }
}

async fn test_attachment_crud(store: &dyn MetadataStore) {
    let record = AttachmentRecord {
        attachment_id: AttachmentId::new("att-crud-1"),
        message_id: Some(MessageId::new("owner-1")),
        blob_id: BlobId::of(b"attachment bytes"),
        content_type: ContentType::new("application/pdf"),
        size: 16,
    };
    store.store_attachment(record.clone()).await.unwrap();

    assert_eq!(
        store
            .get_attachment(&record.attachment_id)
            .await
            .unwrap()
            .unwrap(),
        record
    );

    let blobs: Vec<BlobId> = store.list_attachment_blobs().try_collect().await.unwrap();
    assert!(blobs.contains(&record.blob_id));

    store.delete_attachment(&record.attachment_id).await.unwrap();
    assert!(
        store
            .get_attachment(&record.attachment_id)
            .await
            .unwrap()
            .is_none()
    );
    store.delete_attachment(&record.attachment_id).await.unwrap();
}

async fn test_attachment_message_id_update(store: &dyn MetadataStore) {
    let record = AttachmentRecord {
        attachment_id: AttachmentId::new("att-orphan-1"),
        message_id: None,
        blob_id: BlobId::of(b"orphan bytes"),
        content_type: ContentType::new("text/plain"),
        size: 12,
    };
    store.store_attachment(record.clone()).await.unwrap();

    let updated = store
        .set_attachment_message_id(&record.attachment_id, &MessageId::new("late-owner"))
        .await
        .unwrap();
    assert!(updated);

    let fetched = store
        .get_attachment(&record.attachment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.message_id, Some(MessageId::new("late-owner")));
    // Only the owner changes
    assert_eq!(fetched.blob_id, record.blob_id);
    assert_eq!(fetched.content_type, record.content_type);
    assert_eq!(fetched.size, record.size);

    let missing = store
        .set_attachment_message_id(&AttachmentId::new("att-missing"), &MessageId::new("x"))
        .await
        .unwrap();
    assert!(!missing);
    assert!(
        store
            .get_attachment(&AttachmentId::new("att-missing"))
            .await
            .unwrap()
            .is_none()
    );

    store.delete_attachment(&record.attachment_id).await.unwrap();
}

async fn test_upload_rows(store: &dyn MetadataStore) {
    let bucket = BucketName::new("uploads-100");
    let older = upload("conformance-alice", 10);
    let newer = upload("conformance-alice", 1);
    let other = upload("conformance-bob", 5);

    store.store_upload(&bucket, newer.clone()).await.unwrap();
    store.store_upload(&bucket, older.clone()).await.unwrap();
    store.store_upload(&bucket, other.clone()).await.unwrap();

    let (found_bucket, found) = store.find_upload(&older.upload_id).await.unwrap().unwrap();
    assert_eq!(found_bucket, bucket);
    assert_eq!(found.owner, older.owner);
    assert_eq!(found.blob_id, older.blob_id);

    let listed = store
        .list_uploads(&Username::new("conformance-alice"))
        .await
        .unwrap();
    let ids: Vec<UploadId> = listed.iter().map(|u| u.upload_id).collect();
    assert_eq!(ids, vec![older.upload_id, newer.upload_id]);

    store.delete_upload(&bucket, &older.upload_id).await.unwrap();
    assert!(store.find_upload(&older.upload_id).await.unwrap().is_none());
    assert!(store.find_upload(&UploadId::random()).await.unwrap().is_none());

    store.delete_upload_bucket(&bucket).await.unwrap();
}

async fn test_upload_buckets(store: &dyn MetadataStore) {
    let week_1 = BucketName::new("uploads-200");
    let week_2 = BucketName::new("uploads-201");
    store
        .store_upload(&week_1, upload("conformance-carol", 3))
        .await
        .unwrap();
    store
        .store_upload(&week_1, upload("conformance-carol", 2))
        .await
        .unwrap();
    let kept = upload("conformance-carol", 1);
    store.store_upload(&week_2, kept.clone()).await.unwrap();

    let buckets = store.list_upload_buckets().await.unwrap();
    assert!(buckets.contains(&week_1));
    assert!(buckets.contains(&week_2));

    assert_eq!(store.delete_upload_bucket(&week_1).await.unwrap(), 2);
    assert_eq!(store.delete_upload_bucket(&week_1).await.unwrap(), 0);

    let buckets = store.list_upload_buckets().await.unwrap();
    assert!(!buckets.contains(&week_1));
    assert!(store.find_upload(&kept.upload_id).await.unwrap().is_some());

    store.delete_upload_bucket(&week_2).await.unwrap();
}
