//! Email batching.
//!
//! Emails are packed into large EmailBatch blocks rather than stored one
//! block each. The builder accumulates parsed messages in memory, hands
//! out final [`EmailId`]s immediately (the batch block id is reserved up
//! front), and freezes into a framed payload when the adaptive size
//! target or the idle deadline is hit.
//!
//! # Batch payload framing (big-endian)
//!
//! ```text
//! count u32
//! offset index: count x u32        present iff count > 64; entry i's
//!                                  byte offset from the start of the
//!                                  entries area
//! entries, each:
//!     local_id u32
//!     envelope_hash [u8; 32]
//!     content_hash  [u8; 32]
//!     eml_len u32
//!     eml bytes
//! ```

use crate::{email::ParsedEmail, EngineError, EngineResult};
use emdb_types::EmailId;
use tracing::debug;

/// Entry overhead before the EML bytes.
const ENTRY_HEADER_LEN: usize = 4 + 32 + 32 + 4;

/// Batches over this many emails always carry the offsets index.
const OFFSETS_INDEX_THRESHOLD: usize = 64;

/// Maps total database size to the batch size target.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveBlockSizer;

impl AdaptiveBlockSizer {
    /// Target batch payload size in MB for a database of `db_size` bytes.
    pub const fn target_mb(db_size: u64) -> u64 {
        const GB: u64 = 1 << 30;
        match db_size {
            s if s < 5 * GB => 50,
            s if s < 25 * GB => 100,
            s if s < 100 * GB => 250,
            s if s < 500 * GB => 500,
            _ => 1024,
        }
    }

    /// Target batch payload size in bytes.
    pub const fn target_bytes(db_size: u64) -> u64 {
        Self::target_mb(db_size) * 1024 * 1024
    }
}

/// One email pending inside an unflushed batch.
#[derive(Debug, Clone)]
pub struct PendingEmail {
    /// Position within the batch.
    pub local_id: i32,
    /// The parsed message.
    pub email: ParsedEmail,
}

/// Accumulates emails until the batch is worth writing.
#[derive(Debug)]
pub struct EmailBatchBuilder {
    batch_id: i64,
    pending: Vec<PendingEmail>,
    payload_bytes: usize,
    target_bytes: u64,
    /// Unix-ms of the last append, for the idle flush check.
    last_append_ms: i64,
}

impl EmailBatchBuilder {
    /// Starts an empty batch under a reserved block id.
    pub fn new(batch_id: i64, target_bytes: u64, now_ms: i64) -> Self {
        Self {
            batch_id,
            pending: Vec::new(),
            payload_bytes: 4,
            target_bytes,
            last_append_ms: now_ms,
        }
    }

    /// The block id this batch will be written as.
    pub const fn batch_id(&self) -> i64 {
        self.batch_id
    }

    /// Emails accumulated so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when no email has been added.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Appends an email and returns its final id.
    pub fn push(&mut self, email: ParsedEmail, now_ms: i64) -> EngineResult<EmailId> {
        if self.pending.len() > i32::MAX as usize {
            return Err(EngineError::InvalidArgument("batch is full".into()));
        }
        let local_id = self.pending.len() as i32;
        self.payload_bytes += ENTRY_HEADER_LEN + email.raw.len();
        self.pending.push(PendingEmail { local_id, email });
        self.last_append_ms = now_ms;
        Ok(EmailId::new(self.batch_id, local_id))
    }

    /// Looks up a pending email by local id.
    pub fn get(&self, local_id: i32) -> Option<&ParsedEmail> {
        usize::try_from(local_id).ok().and_then(|i| self.pending.get(i)).map(|p| &p.email)
    }

    /// The pending emails in local-id order.
    pub fn emails(&self) -> impl Iterator<Item = (EmailId, &ParsedEmail)> {
        self.pending
            .iter()
            .map(|p| (EmailId::new(self.batch_id, p.local_id), &p.email))
    }

    /// True once the accumulated payload crosses the size target or the
    /// builder has sat idle past `flush_interval_ms` with content.
    pub fn should_flush(&self, now_ms: i64, flush_interval_ms: i64) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.payload_bytes as u64 >= self.target_bytes
            || now_ms.saturating_sub(self.last_append_ms) > flush_interval_ms
    }

    /// Freezes the batch into its framed payload. The builder is left
    /// empty and must not be reused for the same batch id.
    pub fn serialize_block(&mut self) -> Vec<u8> {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        let with_index = count > OFFSETS_INDEX_THRESHOLD;

        let mut out = Vec::with_capacity(self.payload_bytes + if with_index { count * 4 } else { 0 });
        out.extend_from_slice(&(count as u32).to_be_bytes());

        if with_index {
            let mut offset = 0u32;
            for p in &pending {
                out.extend_from_slice(&offset.to_be_bytes());
                offset += (ENTRY_HEADER_LEN + p.email.raw.len()) as u32;
            }
        }

        for p in &pending {
            out.extend_from_slice(&(p.local_id as u32).to_be_bytes());
            out.extend_from_slice(&p.email.envelope_hash);
            out.extend_from_slice(&p.email.content_hash);
            out.extend_from_slice(&(p.email.raw.len() as u32).to_be_bytes());
            out.extend_from_slice(&p.email.raw);
        }

        debug!(
            target: "emdb::batch",
            batch_id = self.batch_id,
            count,
            bytes = out.len(),
            with_index,
            "serialized email batch"
        );
        self.payload_bytes = 4;
        out
    }
}

/// Read-side view of a framed batch payload.
#[derive(Debug)]
pub struct BatchReader<'a> {
    count: usize,
    /// Offset index area, empty when the batch was written without one.
    offsets: &'a [u8],
    entries: &'a [u8],
}

/// One decoded batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    /// Position within the batch.
    pub local_id: i32,
    /// SHA-256 over the canonical headers, as recorded at import.
    pub envelope_hash: &'a [u8; 32],
    /// SHA-256 over the raw EML, as recorded at import.
    pub content_hash: &'a [u8; 32],
    /// The raw EML bytes.
    pub raw: &'a [u8],
}

impl<'a> BatchReader<'a> {
    /// Parses the framing prefix of a batch payload.
    pub fn new(payload: &'a [u8]) -> EngineResult<Self> {
        let corrupt = |m: &str| EngineError::EncodingMismatch(format!("batch payload: {m}"));
        if payload.len() < 4 {
            return Err(corrupt("missing count"));
        }
        let count = u32::from_be_bytes(payload[0..4].try_into().expect("4 bytes")) as usize;
        let body = &payload[4..];
        let (offsets, entries) = if count > OFFSETS_INDEX_THRESHOLD {
            if body.len() < count * 4 {
                return Err(corrupt("truncated offsets index"));
            }
            body.split_at(count * 4)
        } else {
            (&body[..0], body)
        };
        Ok(Self { count, offsets, entries })
    }

    /// Emails in the batch.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Returns one entry. With the offsets index this is O(1); without
    /// it a forward scan over at most 64 entries.
    pub fn entry(&self, local_id: i32) -> EngineResult<BatchEntry<'a>> {
        let idx = usize::try_from(local_id)
            .map_err(|_| EngineError::InvalidArgument(format!("negative local id {local_id}")))?;
        if idx >= self.count {
            return Err(EngineError::NotFound(format!(
                "local id {local_id} in a batch of {}",
                self.count
            )));
        }

        if self.offsets.is_empty() {
            return self
                .iter()
                .nth(idx)
                .ok_or_else(|| EngineError::EncodingMismatch("truncated batch payload".into()));
        }

        let at = idx * 4;
        let offset =
            u32::from_be_bytes(self.offsets[at..at + 4].try_into().expect("4 bytes")) as usize;
        self.entry_at(offset).ok_or_else(|| {
            EngineError::EncodingMismatch(format!("bad offsets index for local id {local_id}"))
        })
    }

    fn entry_at(&self, offset: usize) -> Option<BatchEntry<'a>> {
        let bytes = self.entries.get(offset..)?;
        if bytes.len() < ENTRY_HEADER_LEN {
            return None;
        }
        let local_id = u32::from_be_bytes(bytes[0..4].try_into().ok()?) as i32;
        let envelope_hash: &[u8; 32] = bytes[4..36].try_into().ok()?;
        let content_hash: &[u8; 32] = bytes[36..68].try_into().ok()?;
        let eml_len = u32::from_be_bytes(bytes[68..72].try_into().ok()?) as usize;
        let raw = bytes.get(ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + eml_len)?;
        Some(BatchEntry { local_id, envelope_hash, content_hash, raw })
    }

    /// Iterates all entries in local-id order.
    pub fn iter(&self) -> BatchIter<'a, '_> {
        BatchIter { reader: self, offset: 0, remaining: self.count }
    }
}

/// Forward iterator over batch entries.
#[derive(Debug)]
pub struct BatchIter<'a, 'r> {
    reader: &'r BatchReader<'a>,
    offset: usize,
    remaining: usize,
}

impl<'a> Iterator for BatchIter<'a, '_> {
    type Item = BatchEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let entry = self.reader.entry_at(self.offset)?;
        self.offset += ENTRY_HEADER_LEN + entry.raw.len();
        self.remaining -= 1;
        Some(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn parsed(n: usize) -> ParsedEmail {
        let eml = format!(
            "Message-ID: <m{n}@example.com>\r\nSubject: email {n}\r\n\r\nbody {n}\r\n"
        );
        ParsedEmail::parse(eml.into_bytes()).unwrap()
    }

    #[test]
    fn sizer_ladder_matches_the_table() {
        const GB: u64 = 1 << 30;
        for (db_size, expected) in
            [(GB, 50), (10 * GB, 100), (50 * GB, 250), (200 * GB, 500), (600 * GB, 1024)]
        {
            assert_eq!(AdaptiveBlockSizer::target_mb(db_size), expected, "at {db_size}");
        }
        // Boundary values land on the larger tier.
        assert_eq!(AdaptiveBlockSizer::target_mb(5 * GB), 100);
        assert_eq!(AdaptiveBlockSizer::target_mb(500 * GB), 1024);
    }

    #[test]
    fn ids_are_assigned_in_order() {
        let mut builder = EmailBatchBuilder::new(42, 1 << 20, NOW);
        assert_eq!(builder.push(parsed(0), NOW).unwrap(), EmailId::new(42, 0));
        assert_eq!(builder.push(parsed(1), NOW).unwrap(), EmailId::new(42, 1));
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.get(1).unwrap().subject, "email 1");
        assert!(builder.get(2).is_none());
    }

    #[test]
    fn small_batch_roundtrips_without_index() {
        let mut builder = EmailBatchBuilder::new(7, 1 << 20, NOW);
        let originals: Vec<ParsedEmail> = (0..5).map(parsed).collect();
        for email in &originals {
            builder.push(email.clone(), NOW).unwrap();
        }
        let payload = builder.serialize_block();
        let reader = BatchReader::new(&payload).unwrap();
        assert_eq!(reader.count(), 5);
        for (i, original) in originals.iter().enumerate() {
            let entry = reader.entry(i as i32).unwrap();
            assert_eq!(entry.raw, original.raw.as_slice());
            assert_eq!(entry.envelope_hash, &original.envelope_hash);
            assert_eq!(entry.content_hash, &original.content_hash);
        }
    }

    #[test]
    fn large_batch_roundtrips_with_index() {
        let mut builder = EmailBatchBuilder::new(7, 1 << 30, NOW);
        let n = OFFSETS_INDEX_THRESHOLD + 10;
        for i in 0..n {
            builder.push(parsed(i), NOW).unwrap();
        }
        let payload = builder.serialize_block();
        let reader = BatchReader::new(&payload).unwrap();
        assert_eq!(reader.count(), n);
        // Spot-check random access through the offsets index.
        for i in [0, 1, 63, 64, n - 1] {
            let entry = reader.entry(i as i32).unwrap();
            assert_eq!(entry.local_id, i as i32);
            assert!(std::str::from_utf8(entry.raw).unwrap().contains(&format!("email {i}")));
        }
    }

    #[test]
    fn iteration_yields_every_entry() {
        let mut builder = EmailBatchBuilder::new(7, 1 << 20, NOW);
        for i in 0..12 {
            builder.push(parsed(i), NOW).unwrap();
        }
        let payload = builder.serialize_block();
        let reader = BatchReader::new(&payload).unwrap();
        let ids: Vec<i32> = reader.iter().map(|e| e.local_id).collect();
        assert_eq!(ids, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn flush_on_size_and_idle() {
        let mut builder = EmailBatchBuilder::new(1, 200, NOW);
        assert!(!builder.should_flush(NOW, 30_000));
        builder.push(parsed(0), NOW).unwrap();
        // Small payload, fresh: no flush yet.
        assert!(!builder.should_flush(NOW + 1_000, 30_000));
        // Idle past the interval: flush.
        assert!(builder.should_flush(NOW + 31_000, 30_000));
        // Size target crossed: flush regardless of idle time.
        builder.push(parsed(1), NOW).unwrap();
        builder.push(parsed(2), NOW).unwrap();
        assert!(builder.should_flush(NOW, 30_000));
    }

    #[test]
    fn out_of_range_local_id_is_not_found() {
        let mut builder = EmailBatchBuilder::new(7, 1 << 20, NOW);
        builder.push(parsed(0), NOW).unwrap();
        let payload = builder.serialize_block();
        let reader = BatchReader::new(&payload).unwrap();
        assert!(matches!(reader.entry(5), Err(EngineError::NotFound(_))));
    }
}
