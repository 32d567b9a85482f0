//! Mailstore - content-addressed storage for mail artifacts
//!
//! This crate provides:
//! - Blob storage keyed by the SHA-256 of the content (deduplicating)
//! - Message, attachment and upload repositories over a metadata row store
//! - Weekly upload buckets and a retention sweep that reclaims them
//! - An in-memory task manager running the sweep in the background
//!
//! Messages are split into a header blob (compressed when large) and a
//! streamed body blob; metadata rows only hold blob ids.

pub mod bucket;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod storage;
pub mod task;

pub use bucket::{BucketNameGenerator, Clock, ManualClock, SystemClock, UploadBucketName};
pub use crate::config::StoreConfig;
pub use error::{Result, StoreError};
pub use models::{
    Attachment, AttachmentId, AttachmentRecord, AttachmentRef, BlobId, Cid, ContentType,
    FetchType, MailMessage, MessageId, MessageRepresentation, Properties, Upload, UploadId,
    UploadMetadata, Username,
};
pub use repository::{AttachmentRepository, MessageRepository, Repositories, UploadRepository};
pub use storage::{
    BlobCodec, BlobStore, BucketName, FileBlobStore, InMemoryBlobStore, InMemoryMetadataStore,
    MetadataStore, SqliteMetadataStore, StoragePolicy,
};
pub use task::{
    CleanupReport, CleanupScope, InMemoryTaskManager, RetentionCleanupTask, Task,
    TaskExecutionDetails, TaskId, TaskManager, TaskStatus,
};
