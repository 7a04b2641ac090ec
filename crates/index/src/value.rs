//! Values stored in the index trees.

use emdb_types::EmailId;
use serde::{Deserialize, Serialize};

/// One search-term occurrence list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// The email containing the term.
    pub email_id: EmailId,
    /// Bitmask of the fields the term occurred in (subject, from, to,
    /// body; assignment owned by the search layer).
    pub fields: u8,
    /// Term frequency across those fields.
    pub term_frequency: u32,
}

/// The value side of an index entry. Which variant an index uses is fixed
/// per index; mixing them is a [`KeyTypeMismatch`](crate::IndexError).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexValue {
    /// A single email address (message-id and envelope-hash indexes).
    Email(EmailId),
    /// An ordered email list (folder membership).
    EmailList(Vec<EmailId>),
    /// Search postings (term index).
    Postings(Vec<Posting>),
}

impl IndexValue {
    /// Variant name for diagnostics.
    pub const fn variant(&self) -> &'static str {
        match self {
            Self::Email(_) => "Email",
            Self::EmailList(_) => "EmailList",
            Self::Postings(_) => "Postings",
        }
    }
}
