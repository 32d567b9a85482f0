//! Message models: the input to a save and the reconstructed representation

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentId, BlobId, MessageId, Properties};

/// Content identifier referencing an inline attachment (`cid:` URLs)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cid(String);

impl Cid {
    /// Strict parse: the value must be non-blank once `<...>` is unwrapped
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let unwrapped = match trimmed.strip_prefix('<') {
            Some(rest) => rest.strip_suffix('>')?,
            None if trimmed.ends_with('>') => return None,
            None => trimmed,
        };
        let unwrapped = unwrapped.trim();
        if unwrapped.is_empty() || unwrapped.contains(char::is_whitespace) {
            return None;
        }
        Some(Self(unwrapped.to_string()))
    }

    /// Lenient parse used when decoding stored rows
    ///
    /// Missing or blank values become `None`; malformed values are kept as
    /// written instead of failing the whole read.
    pub fn parse_relaxed(value: Option<&str>) -> Option<Self> {
        let value = value?;
        if value.trim().is_empty() {
            return None;
        }
        Self::parse(value).or_else(|| Some(Self(value.trim().to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Reference from a message to one of its attachments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub attachment_id: AttachmentId,
    pub name: Option<String>,
    pub cid: Option<Cid>,
    pub is_inline: bool,
}

impl AttachmentRef {
    pub fn new(attachment_id: AttachmentId) -> Self {
        Self {
            attachment_id,
            name: None,
            cid: None,
            is_inline: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn inline(mut self, cid: Cid) -> Self {
        self.cid = Some(cid);
        self.is_inline = true;
        self
    }
}

/// How much of a message's content to materialize on read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchType {
    /// Header bytes followed by body bytes
    Full,
    /// Header bytes only
    Headers,
    /// Body bytes, left-padded with zeros up to the body offset
    Body,
    /// No content, structured fields only
    Metadata,
}

/// A message handed to the repository for storage
///
/// `content` holds the raw RFC 5322 bytes; the header occupies
/// `content[..body_start_octet]` and the body the rest.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub message_id: MessageId,
    pub internal_date: DateTime<Utc>,
    pub content: Bytes,
    pub body_start_octet: usize,
    pub properties: Properties,
    pub attachments: Vec<AttachmentRef>,
}

impl MailMessage {
    /// Create a new message builder
    pub fn builder(message_id: MessageId, content: impl Into<Bytes>) -> MailMessageBuilder {
        MailMessageBuilder::new(message_id, content.into())
    }

    /// Build a message from raw bytes, locating the header/body boundary
    ///
    /// The body starts after the first empty line (CRLF or bare LF). A message
    /// without an empty line is all header. The textual line count of the body
    /// is filled in.
    pub fn from_raw(message_id: MessageId, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        let body_start_octet = find_body_start(&content);
        let mut properties = Properties::default();
        properties.textual_line_count = Some(count_lines(&content[body_start_octet..]));

        Self::builder(message_id, content)
            .body_start_octet(body_start_octet)
            .properties(properties)
            .build()
    }

    pub fn header_octets(&self) -> usize {
        self.body_start_octet
    }

    pub fn body_octets(&self) -> usize {
        self.content.len().saturating_sub(self.body_start_octet)
    }

    pub fn full_content_octets(&self) -> usize {
        self.content.len()
    }

    /// Header bytes (zero-copy slice)
    pub fn header_content(&self) -> Bytes {
        self.content.slice(..self.body_start())
    }

    /// Body bytes (zero-copy slice)
    pub fn body_content(&self) -> Bytes {
        self.content.slice(self.body_start()..)
    }

    fn body_start(&self) -> usize {
        self.body_start_octet.min(self.content.len())
    }
}

/// Builder for creating MailMessage instances
pub struct MailMessageBuilder {
    message_id: MessageId,
    content: Bytes,
    internal_date: Option<DateTime<Utc>>,
    body_start_octet: Option<usize>,
    properties: Properties,
    attachments: Vec<AttachmentRef>,
}

impl MailMessageBuilder {
    fn new(message_id: MessageId, content: Bytes) -> Self {
        Self {
            message_id,
            content,
            internal_date: None,
            body_start_octet: None,
            properties: Properties::default(),
            attachments: Vec::new(),
        }
    }

    pub fn internal_date(mut self, internal_date: DateTime<Utc>) -> Self {
        self.internal_date = Some(internal_date);
        self
    }

    /// Offset of the body; clamped to the content length
    pub fn body_start_octet(mut self, body_start_octet: usize) -> Self {
        self.body_start_octet = Some(body_start_octet);
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn build(self) -> MailMessage {
        let body_start_octet = self
            .body_start_octet
            .unwrap_or_else(|| find_body_start(&self.content))
            .min(self.content.len());

        MailMessage {
            message_id: self.message_id,
            internal_date: self.internal_date.unwrap_or_else(Utc::now),
            content: self.content,
            body_start_octet,
            properties: self.properties,
            attachments: self.attachments,
        }
    }
}

/// A message read back from the repository
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRepresentation {
    pub message_id: MessageId,
    pub internal_date: DateTime<Utc>,
    /// Full content octets of the original message
    pub size: u64,
    pub body_start_octet: usize,
    /// Materialized bytes; shape depends on the requested [`FetchType`]
    pub content: Bytes,
    pub properties: Properties,
    pub attachments: Vec<AttachmentRef>,
    pub header_id: BlobId,
    pub body_id: BlobId,
}

fn find_body_start(content: &[u8]) -> usize {
    if content.starts_with(b"\r\n") {
        return 2;
    }
    if content.starts_with(b"\n") {
        return 1;
    }
    let crlf = content
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4);
    let lf = content
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| pos + 2);

    match (crlf, lf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => content.len(),
    }
}

fn count_lines(body: &[u8]) -> u64 {
    if body.is_empty() {
        return 0;
    }
    let newlines = body.iter().filter(|b| **b == b'\n').count() as u64;
    if body.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}
