//! Upload models

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BlobId, ContentType, UploadId, Username};

/// Upload metadata row, stored under the bucket of its upload week
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub upload_id: UploadId,
    pub owner: Username,
    pub blob_id: BlobId,
    pub content_type: ContentType,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// An upload together with its content
#[derive(Debug, Clone)]
pub struct Upload {
    pub metadata: UploadMetadata,
    pub content: Bytes,
}
