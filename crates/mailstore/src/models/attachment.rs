//! Attachment metadata models

use serde::{Deserialize, Serialize};

use super::{AttachmentId, BlobId, ContentType, MessageId};

/// Attachment metadata row
///
/// `message_id` may be absent on rows written before the owning message was
/// recorded durably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub attachment_id: AttachmentId,
    pub message_id: Option<MessageId>,
    pub blob_id: BlobId,
    pub content_type: ContentType,
    pub size: u64,
}

/// Attachment metadata with its owning message resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: AttachmentId,
    pub message_id: MessageId,
    pub blob_id: BlobId,
    pub content_type: ContentType,
    pub size: u64,
}

impl Attachment {
    pub(crate) fn from_record(record: AttachmentRecord, message_id: MessageId) -> Self {
        Self {
            attachment_id: record.attachment_id,
            message_id,
            blob_id: record.blob_id,
            content_type: record.content_type,
            size: record.size,
        }
    }
}
