//! Tamper-evidence hash chain.
//!
//! Every opted-in block append is followed by a HashChain block whose
//! entry carries the SHA-256 of the appended block's encoded bytes and
//! the hash of the previous entry, forming one linear chain. Chain
//! blocks are written plain (no compression, no encryption) so the chain
//! stays verifiable without the master key. Entries are append-only and
//! never superseded.

use crate::{EngineError, EngineResult};
use emdb_codec::{decode_block, encode_block, CodecConfig};
use emdb_store::{BlockIdAllocator, RawBlockStore};
use emdb_types::{
    content::HashChainHead, BlockContent, BlockType, Encoding, HashChainEntry,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// True when every checked entry held.
    pub ok: bool,
    /// Entries examined.
    pub checked: u64,
    /// Sequence number of the first bad entry, when not ok.
    pub first_bad_sequence: Option<u64>,
    /// What failed there.
    pub failure: Option<String>,
}

impl VerificationResult {
    fn ok(checked: u64) -> Self {
        Self { ok: true, checked, first_bad_sequence: None, failure: None }
    }

    fn bad(checked: u64, sequence: u64, failure: String) -> Self {
        Self { ok: false, checked, first_bad_sequence: Some(sequence), failure: Some(failure) }
    }
}

#[derive(Debug, Default)]
struct ChainState {
    /// Chain entry block ids in sequence order.
    entry_blocks: Vec<i64>,
    /// Sequence of the newest entry, 0 before the first.
    sequence: u64,
    /// SHA-256 of the newest entry's payload, all-zero before the first.
    head_hash: [u8; 32],
}

/// Maintains and verifies the hash chain.
#[derive(Debug)]
pub struct HashChainManager {
    store: Arc<RawBlockStore>,
    ids: Arc<BlockIdAllocator>,
    state: Mutex<ChainState>,
}

impl HashChainManager {
    /// Rebuilds chain state from the chain blocks found by the open
    /// scan. `chain_blocks` may arrive in any order.
    pub fn load(
        store: Arc<RawBlockStore>,
        ids: Arc<BlockIdAllocator>,
        chain_blocks: &[i64],
    ) -> EngineResult<Self> {
        let mut entries: Vec<(HashChainEntry, i64)> = Vec::with_capacity(chain_blocks.len());
        for &block_id in chain_blocks {
            let block = store.read(block_id)?;
            if let BlockContent::HashChain(entry) = decode_block(&block, None)? {
                entries.push((entry, block_id));
            }
        }
        entries.sort_by_key(|(entry, _)| entry.sequence);

        let mut state = ChainState::default();
        if let Some((last, _)) = entries.last() {
            state.sequence = last.sequence;
            state.head_hash = entry_hash(last)?;
        }
        state.entry_blocks = entries.into_iter().map(|(_, id)| id).collect();

        info!(
            target: "emdb::chain",
            entries = state.entry_blocks.len(),
            sequence = state.sequence,
            "loaded hash chain"
        );
        Ok(Self { store, ids, state: Mutex::new(state) })
    }

    /// Appends a chain entry covering `block_id`, which must already be
    /// durable. Returns the new head for the next Metadata write.
    pub fn append_entry(&self, block_id: i64, now_ms: i64) -> EngineResult<HashChainHead> {
        let block_bytes = self.store.read_encoded(block_id)?;
        let block_hash: [u8; 32] = Sha256::digest(&block_bytes).into();

        let mut state = self.state.lock();
        let entry = HashChainEntry {
            block_id,
            block_hash,
            previous_entry_hash: state.head_hash,
            sequence: state.sequence + 1,
        };

        let entry_block_id = self.ids.next_id();
        let block = encode_block(
            &BlockContent::HashChain(entry.clone()),
            BlockType::HashChain,
            entry_block_id,
            now_ms,
            Encoding::Json,
            CodecConfig::PLAIN,
            None,
        )?;
        self.store.append(&block)?;

        state.sequence = entry.sequence;
        state.head_hash = entry_hash(&entry)?;
        state.entry_blocks.push(entry_block_id);
        debug!(
            target: "emdb::chain",
            block_id,
            sequence = entry.sequence,
            "appended hash chain entry"
        );
        Ok(HashChainHead { sequence: state.sequence, entry_hash: state.head_hash })
    }

    /// Current head, `None` before the first entry.
    pub fn head(&self) -> Option<HashChainHead> {
        let state = self.state.lock();
        (state.sequence > 0)
            .then_some(HashChainHead { sequence: state.sequence, entry_hash: state.head_hash })
    }

    /// Recomputes and checks the chain over `range` (inclusive sequence
    /// bounds; `None` means the whole chain). Linkage and monotonicity
    /// are always checked; a target block's hash is checked when the
    /// block is still readable; compaction may have dropped superseded
    /// targets, which does not break the chain itself.
    pub fn verify(&self, range: Option<(u64, u64)>) -> EngineResult<VerificationResult> {
        let entry_blocks = self.state.lock().entry_blocks.clone();
        let mut previous: Option<HashChainEntry> = None;
        let mut checked = 0u64;

        for &entry_block in &entry_blocks {
            let block = self.store.read(entry_block)?;
            let BlockContent::HashChain(entry) = decode_block(&block, None)? else {
                return Ok(VerificationResult::bad(
                    checked,
                    0,
                    format!("block {entry_block} is not a hash chain entry"),
                ));
            };

            if let Some((from, to)) = range {
                if entry.sequence < from || entry.sequence > to {
                    previous = Some(entry);
                    continue;
                }
            }
            checked += 1;

            if let Some(prev) = &previous {
                if entry.sequence != prev.sequence + 1 {
                    return Ok(VerificationResult::bad(
                        checked,
                        entry.sequence,
                        format!("sequence jumped from {} to {}", prev.sequence, entry.sequence),
                    ));
                }
                let expected = entry_hash(prev)?;
                if entry.previous_entry_hash != expected {
                    return Ok(VerificationResult::bad(
                        checked,
                        entry.sequence,
                        "previous-entry hash does not match".into(),
                    ));
                }
            } else if entry.previous_entry_hash != [0u8; 32] && entry.sequence == 1 {
                return Ok(VerificationResult::bad(
                    checked,
                    entry.sequence,
                    "first entry carries a non-zero previous hash".into(),
                ));
            }

            if self.store.contains(entry.block_id) {
                let target = self.store.read_encoded(entry.block_id)?;
                let actual: [u8; 32] = Sha256::digest(&target).into();
                if actual != entry.block_hash {
                    return Ok(VerificationResult::bad(
                        checked,
                        entry.sequence,
                        format!("block {} bytes do not match the chained hash", entry.block_id),
                    ));
                }
            }

            previous = Some(entry);
        }

        Ok(VerificationResult::ok(checked))
    }
}

/// The hash of one entry, as chained by its successor: SHA-256 over the
/// entry's canonical JSON payload.
fn entry_hash(entry: &HashChainEntry) -> EngineResult<[u8; 32]> {
    let bytes = serde_json::to_vec(entry)
        .map_err(|e| EngineError::EncodingMismatch(e.to_string()))?;
    Ok(Sha256::digest(&bytes).into())
}
