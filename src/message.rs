//! # Messages and attachments.
//!
//! Only the parts of a message the renderer and the transfer service touch
//! are modelled here. Everything else is owned by the application.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{SessionKey, SignatureStatus};

/// Server-side message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    /// Wraps a server identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg#{}", self.0)
    }
}

/// Server-side attachment identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentId(String);

impl AttachmentId {
    /// Wraps a server identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Att#{}", self.0)
    }
}

/// How the payload of an attachment is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionScheme {
    /// Stored in plain, for example mail sent before encryption existed.
    #[default]
    None,

    /// Separately encrypted packet with its own key packets.
    Inline,

    /// Part of a PGP/MIME body, the plaintext arrives with the body.
    Mime,
}

/// Headers of the MIME part an attachment came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentHeaders {
    #[serde(rename = "content-id", default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,

    #[serde(
        rename = "content-disposition",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_disposition: Option<String>,

    #[serde(
        rename = "content-location",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_location: Option<String>,

    /// Set to 1 by the server for parts referenced from the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded: Option<i64>,
}

/// An attachment as the API describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    #[serde(rename = "ID")]
    pub id: AttachmentId,

    pub name: String,

    #[serde(rename = "MIMEType")]
    pub mime_type: String,

    #[serde(default)]
    pub size: u64,

    /// Encrypted session key of the data packet.
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub key_packets: Option<Vec<u8>>,

    /// Detached signature of the plaintext.
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,

    #[serde(default)]
    pub headers: AttachmentHeaders,

    /// Session key, known once the key packets were decrypted locally.
    #[serde(skip)]
    pub session_key: Option<SessionKey>,

    /// Plaintext shipped with a PGP/MIME body.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,

    #[serde(skip)]
    pub signature_status: SignatureStatus,
}

impl Attachment {
    /// Content identifier the body refers to this attachment with,
    /// without angle brackets or quotes.
    ///
    /// Falls back to `Content-Location` for mailers that reference
    /// images by location.
    pub fn cid(&self) -> Option<String> {
        let header = self
            .headers
            .content_id
            .as_deref()
            .or(self.headers.content_location.as_deref())?;
        let cid = header
            .trim()
            .trim_matches(|c| matches!(c, '<' | '>' | '"' | '\''))
            .trim();
        if cid.is_empty() {
            None
        } else {
            Some(cid.to_string())
        }
    }

    /// Whether the attachment is shown inline in the body.
    pub fn is_embedded(&self) -> bool {
        let inline = self
            .headers
            .content_disposition
            .as_deref()
            .map_or(false, |d| d.trim().to_ascii_lowercase().starts_with("inline"));
        let flagged = self.headers.embedded == Some(1);
        (inline || flagged) && self.cid().is_some()
    }
}

/// A message as far as rendering and attachment handling are concerned.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: MsgId,

    /// Address the message was sent from, selects the private keys.
    pub address_id: String,

    /// Sender address, `user@domain`.
    pub sender: String,

    pub mime_type: String,

    pub attachments: Vec<Attachment>,

    /// Number of embedded attachments referenced from the body.
    pub num_embedded: usize,

    /// Embedded images were allowed for this message by the user.
    pub show_embedded: bool,

    body: Option<String>,
}

impl Message {
    /// Creates an empty message with the given id.
    pub fn new(id: MsgId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Whether the body is a PGP/MIME structure.
    pub fn is_pgp_mime(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case("multipart/mixed")
    }

    /// The decrypted body, if it is known.
    pub fn decrypted_body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Replaces the decrypted body.
    pub fn set_decrypted_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    /// How the payload of `attachment` is protected.
    ///
    /// Attachments of a draft whose upload did not finish carry no key
    /// packets yet.
    pub fn encryption_of(&self, attachment: &Attachment) -> EncryptionScheme {
        if self.is_pgp_mime() {
            EncryptionScheme::Mime
        } else if attachment.key_packets.is_some() {
            EncryptionScheme::Inline
        } else {
            EncryptionScheme::None
        }
    }

    /// Returns the first attachment with content identifier `cid`.
    pub fn attachment_by_cid(&self, cid: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|attachment| attachment.cid().as_deref() == Some(cid))
    }

    /// Returns the attachment with identifier `id`.
    pub fn attachment(&self, id: &AttachmentId) -> Option<&Attachment> {
        self.attachments.iter().find(|attachment| &attachment.id == id)
    }

    pub(crate) fn attachment_mut(&mut self, id: &AttachmentId) -> Option<&mut Attachment> {
        self.attachments
            .iter_mut()
            .find(|attachment| &attachment.id == id)
    }
}

mod base64_opt {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let Some(encoded) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if encoded.is_empty() {
            return Ok(None);
        }
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
