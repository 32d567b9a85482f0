//! MIME properties stored alongside a message row

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// MIME properties of a message's top-level entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    pub content_description: Option<String>,
    pub content_disposition_type: Option<String>,
    pub media_type: Option<String>,
    pub sub_type: Option<String>,
    pub content_id: Option<String>,
    pub content_md5: Option<String>,
    pub content_transfer_encoding: Option<String>,
    pub content_location: Option<String>,
    pub content_language: Vec<String>,
    pub content_disposition_parameters: BTreeMap<String, String>,
    pub content_type_parameters: BTreeMap<String, String>,
    /// Number of lines in a textual body, if known
    pub textual_line_count: Option<u64>,
}

impl Properties {
    /// Properties for a `type/subtype` message with nothing else set
    pub fn with_media_type(media_type: impl Into<String>, sub_type: impl Into<String>) -> Self {
        Self {
            media_type: Some(media_type.into()),
            sub_type: Some(sub_type.into()),
            ..Self::default()
        }
    }
}
