//! Row encoding for structured message columns
//!
//! Attachment lists and properties are stored as JSON documents. Attachment
//! lists carry a format version so old rows stay readable as the shape evolves.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::models::{AttachmentId, AttachmentRef, Cid, Properties};

const ATTACHMENTS_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredAttachments {
    version: u32,
    items: Vec<StoredAttachmentRef>,
}

#[derive(Serialize, Deserialize)]
struct StoredAttachmentRef {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// Raw value; decoded leniently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cid: Option<String>,
    #[serde(default)]
    is_inline: bool,
}

/// Encode an attachment list; an empty list is stored as NULL
pub(crate) fn encode_attachments(attachments: &[AttachmentRef]) -> Result<Option<String>> {
    if attachments.is_empty() {
        return Ok(None);
    }
    let stored = StoredAttachments {
        version: ATTACHMENTS_VERSION,
        items: attachments
            .iter()
            .map(|a| StoredAttachmentRef {
                id: a.attachment_id.as_str().to_string(),
                name: a.name.clone(),
                cid: a.cid.as_ref().map(|cid| cid.as_str().to_string()),
                is_inline: a.is_inline,
            })
            .collect(),
    };
    Ok(Some(serde_json::to_string(&stored)?))
}

/// Decode an attachment list column
pub(crate) fn decode_attachments(column: Option<&str>) -> Result<Vec<AttachmentRef>> {
    let Some(json) = column else {
        return Ok(Vec::new());
    };
    let stored: StoredAttachments = serde_json::from_str(json)?;
    if stored.version > ATTACHMENTS_VERSION {
        return Err(StoreError::Storage(anyhow::anyhow!(
            "Unsupported attachment list version {}",
            stored.version
        )));
    }
    Ok(stored
        .items
        .into_iter()
        .map(|item| AttachmentRef {
            attachment_id: AttachmentId::new(item.id),
            name: item.name,
            cid: Cid::parse_relaxed(item.cid.as_deref()),
            is_inline: item.is_inline,
        })
        .collect())
}

pub(crate) fn encode_properties(properties: &Properties) -> Result<String> {
    Ok(serde_json::to_string(properties)?)
}

pub(crate) fn decode_properties(json: &str) -> Result<Properties> {
    Ok(serde_json::from_str(json)?)
}
