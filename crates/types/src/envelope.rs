//! Cached header tuples used for fast folder listing.

use crate::EmailId;
use serde::{Deserialize, Serialize};

/// The subset of an email's headers cached inside
/// [`FolderEnvelope`](crate::BlockType::FolderEnvelope) blocks, so that
/// listing a folder never touches the email batches themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Address of the email in its batch.
    pub email_id: EmailId,
    /// RFC 5322 `Message-ID`, angle brackets stripped.
    pub message_id: String,
    /// Decoded `Subject`, empty if absent.
    pub subject: String,
    /// First `From` mailbox.
    pub from: String,
    /// All `To` mailboxes, comma-joined.
    pub to: String,
    /// `Date` header as Unix milliseconds, 0 if unparseable.
    pub date: i64,
    /// Size of the raw EML in bytes.
    pub size: u64,
    /// True when the message carries at least one attachment part.
    pub has_attachments: bool,
    /// Message flags (seen, answered, custom) as free-form strings.
    pub flags: Vec<String>,
    /// SHA-256 over the canonical header block.
    #[serde(with = "crate::content::hex_array")]
    pub envelope_hash: [u8; 32],
}
