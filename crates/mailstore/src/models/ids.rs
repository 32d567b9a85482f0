//! Identifier types for stored entities

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Declares a string-backed identifier with the usual conversions
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        string_id!($(#[$meta])* $name, $kind, require_non_blank);
    };
    ($(#[$meta:meta])* $name:ident, $kind:literal, $check:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Reject malformed identifiers before they reach a store
            pub fn validate(&self) -> Result<()> {
                $check($kind, &self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Externally assigned identifier of a mail message
    MessageId,
    "message id"
);

string_id!(
    /// Identifier of an attachment row
    AttachmentId,
    "attachment id"
);

string_id!(
    /// Identity owning an upload
    Username,
    "username"
);

string_id!(
    /// Content-derived identifier of a stored blob
    ///
    /// The value is the unpadded base64url encoding of the SHA-256 digest of
    /// the blob's bytes, so equal content always yields an equal id.
    BlobId,
    "blob id",
    require_digest
);

impl AttachmentId {
    /// Generate a fresh random attachment id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl BlobId {
    /// Compute the id of an in-memory payload
    pub fn of(content: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(content))
    }

    /// Finish an incremental hash into an id
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }
}

/// Unique identifier of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the textual form; anything that is not a UUID is rejected
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| StoreError::invalid(format!("'{}' is not a valid upload id", s)))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// MIME content type as sent by the producer (e.g. `text/html; charset=utf-8`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentType(pub String);

impl ContentType {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContentType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

pub(crate) fn require_non_blank(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StoreError::invalid(format!("{} must not be blank", kind)));
    }
    Ok(())
}

/// Length of an unpadded base64url SHA-256 digest
const DIGEST_LEN: usize = 43;

/// Blob ids end up in file paths; only accept the digest alphabet
fn require_digest(kind: &str, value: &str) -> Result<()> {
    let well_formed = value.len() == DIGEST_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !well_formed {
        return Err(StoreError::invalid(format!("'{}' is not a valid {}", value, kind)));
    }
    Ok(())
}
