//! The MIME boundary.
//!
//! EML parsing is delegated to `mail-parser`; everything the engine
//! needs from a message is captured here at import time so no other
//! module touches the parser. The envelope hash covers a canonical
//! header tuple, the content hash covers the raw bytes verbatim.

use crate::{EngineError, EngineResult};
use emdb_types::{EmailId, Envelope};
use mail_parser::MessageParser;
use sha2::{Digest, Sha256};

/// An email decoded far enough for storage, indexing, and search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEmail {
    /// The raw EML exactly as imported.
    pub raw: Vec<u8>,
    /// `Message-ID` with angle brackets stripped; synthesized from the
    /// content hash when the header is missing.
    pub message_id: String,
    /// Decoded subject, empty when absent.
    pub subject: String,
    /// First `From` mailbox.
    pub from: String,
    /// All `To` mailboxes, comma-joined.
    pub to: String,
    /// `Date` header as Unix milliseconds, 0 when unparseable.
    pub date: i64,
    /// Decoded text body, empty when absent.
    pub body_text: String,
    /// True when the message carries attachments.
    pub has_attachments: bool,
    /// SHA-256 over the canonical header tuple.
    pub envelope_hash: [u8; 32],
    /// SHA-256 over the raw EML.
    pub content_hash: [u8; 32],
}

impl ParsedEmail {
    /// Parses raw EML bytes. Messages without a `Message-ID` get a
    /// deterministic synthetic one so every email stays addressable.
    pub fn parse(raw: Vec<u8>) -> EngineResult<Self> {
        if raw.is_empty() {
            return Err(EngineError::InvalidArgument("empty EML message".into()));
        }
        let message = MessageParser::new()
            .parse(&raw)
            .ok_or_else(|| EngineError::InvalidArgument("unparseable EML message".into()))?;

        let content_hash: [u8; 32] = Sha256::digest(&raw).into();

        let message_id = match message.message_id() {
            Some(id) if !id.is_empty() => id.trim_matches(['<', '>']).to_owned(),
            _ => format!("{}@synthetic.emdb", hex::encode(&content_hash[..16])),
        };
        let subject = message.subject().unwrap_or_default().to_owned();
        let from = message
            .from()
            .and_then(|a| a.first())
            .and_then(|addr| addr.address().map(str::to_owned))
            .unwrap_or_default();
        let to = message
            .to()
            .map(|a| {
                a.iter()
                    .filter_map(|addr| addr.address())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        let date = message.date().map(|d| d.to_timestamp() * 1000).unwrap_or(0);
        let body_text = message.body_text(0).unwrap_or_default().into_owned();
        let has_attachments = message.attachments().next().is_some();

        let envelope_hash = canonical_envelope_hash(&message_id, &subject, &from, &to, date);

        Ok(Self {
            raw,
            message_id,
            subject,
            from,
            to,
            date,
            body_text,
            has_attachments,
            envelope_hash,
            content_hash,
        })
    }

    /// Size of the raw message in bytes.
    pub fn size(&self) -> u64 {
        self.raw.len() as u64
    }

    /// Builds the cached envelope for folder listings.
    pub fn envelope(&self, email_id: EmailId) -> Envelope {
        Envelope {
            email_id,
            message_id: self.message_id.clone(),
            subject: self.subject.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            date: self.date,
            size: self.size(),
            has_attachments: self.has_attachments,
            flags: Vec::new(),
            envelope_hash: self.envelope_hash,
        }
    }
}

/// SHA-256 over the canonical header tuple. Field order and separators
/// are frozen: changing either silently invalidates every stored
/// envelope-hash index entry.
fn canonical_envelope_hash(
    message_id: &str,
    subject: &str,
    from: &str,
    to: &str,
    date: i64,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in [message_id, subject, from, to] {
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(date.to_be_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "Message-ID: <test-1@example.com>\r\n\
        From: Alice <alice@example.com>\r\n\
        To: bob@example.com, carol@example.com\r\n\
        Subject: Quarterly planning\r\n\
        Date: Mon, 2 Oct 2023 09:30:00 +0000\r\n\
        \r\n\
        Let's sync on the quarterly plan tomorrow.\r\n";

    #[test]
    fn parses_headers_and_body() {
        let email = ParsedEmail::parse(SAMPLE.as_bytes().to_vec()).unwrap();
        assert_eq!(email.message_id, "test-1@example.com");
        assert_eq!(email.subject, "Quarterly planning");
        assert_eq!(email.from, "alice@example.com");
        assert!(email.to.contains("bob@example.com"));
        assert!(email.to.contains("carol@example.com"));
        assert!(email.date > 0);
        assert!(email.body_text.contains("quarterly plan"));
        assert!(!email.has_attachments);
    }

    #[test]
    fn missing_message_id_is_synthesized_deterministically() {
        let eml = b"Subject: no id here\r\n\r\nbody\r\n".to_vec();
        let a = ParsedEmail::parse(eml.clone()).unwrap();
        let b = ParsedEmail::parse(eml).unwrap();
        assert_eq!(a.message_id, b.message_id);
        assert!(a.message_id.ends_with("@synthetic.emdb"));
    }

    #[test]
    fn content_hash_covers_raw_bytes() {
        let a = ParsedEmail::parse(SAMPLE.as_bytes().to_vec()).unwrap();
        let mut altered = SAMPLE.as_bytes().to_vec();
        *altered.last_mut().unwrap() = b' ';
        let b = ParsedEmail::parse(altered).unwrap();
        assert_ne!(a.content_hash, b.content_hash);
        // Headers unchanged, so the envelope hash agrees.
        assert_eq!(a.envelope_hash, b.envelope_hash);
    }

    #[test]
    fn envelope_mirrors_parsed_fields() {
        let email = ParsedEmail::parse(SAMPLE.as_bytes().to_vec()).unwrap();
        let envelope = email.envelope(EmailId::new(4, 2));
        assert_eq!(envelope.email_id, EmailId::new(4, 2));
        assert_eq!(envelope.subject, "Quarterly planning");
        assert_eq!(envelope.size, SAMPLE.len() as u64);
        assert_eq!(envelope.envelope_hash, email.envelope_hash);
    }
}
