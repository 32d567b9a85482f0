//! Domain models for stored mail artifacts

mod attachment;
mod ids;
mod message;
mod properties;
mod upload;

pub use attachment::{Attachment, AttachmentRecord};
pub use ids::{AttachmentId, BlobId, ContentType, MessageId, UploadId, Username};
pub use message::{
    AttachmentRef, Cid, FetchType, MailMessage, MailMessageBuilder, MessageRepresentation,
};
pub use properties::Properties;
pub use upload::{Upload, UploadMetadata};
