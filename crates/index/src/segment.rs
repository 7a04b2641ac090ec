//! Immutable sorted segments.
//!
//! A segment is a frozen memtable: sorted `(key, value)` pairs, tombstones
//! included, serialized with bincode into the payload of one
//! `ZoneTreeSegment_KV` block. Segments are small (bounded by the flush
//! threshold), so they are held fully decoded and looked up by binary
//! search.

use crate::{IndexError, IndexResult, IndexValue};
use serde::{Deserialize, Serialize};

/// Serialized form; the version byte lets the layout evolve without
/// touching the block framing.
#[derive(Debug, Serialize, Deserialize)]
struct SegmentPayload {
    version: u8,
    entries: Vec<(Vec<u8>, Option<IndexValue>)>,
}

const SEGMENT_PAYLOAD_VERSION: u8 = 1;

/// An immutable sorted run of one index.
#[derive(Debug, Clone)]
pub struct Segment {
    /// The block this segment is persisted as.
    pub block_id: i64,
    entries: Vec<(Vec<u8>, Option<IndexValue>)>,
}

impl Segment {
    /// Freezes sorted entries into a segment. The caller guarantees
    /// ascending key order (a drained memtable already is).
    pub fn from_sorted(block_id: i64, entries: Vec<(Vec<u8>, Option<IndexValue>)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        Self { block_id, entries }
    }

    /// Serializes into block payload bytes.
    pub fn to_payload(&self) -> IndexResult<Vec<u8>> {
        bincode::serialize(&SegmentPayload {
            version: SEGMENT_PAYLOAD_VERSION,
            entries: self.entries.clone(),
        })
        .map_err(|e| IndexError::Serialization(e.to_string()))
    }

    /// Deserializes a segment read back from block `block_id`.
    pub fn from_payload(block_id: i64, bytes: &[u8]) -> IndexResult<Self> {
        let payload: SegmentPayload =
            bincode::deserialize(bytes).map_err(|_| IndexError::CorruptSegment(block_id))?;
        if payload.version != SEGMENT_PAYLOAD_VERSION {
            return Err(IndexError::CorruptSegment(block_id));
        }
        Ok(Self { block_id, entries: payload.entries })
    }

    /// Binary-searches for a key. `Some(None)` is a tombstone.
    pub fn get(&self, key: &[u8]) -> Option<&Option<IndexValue>> {
        self.entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// All entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<IndexValue>)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Entry count, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the segment holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
