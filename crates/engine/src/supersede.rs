//! Superseded-block tracking.
//!
//! Supersession is soft delete by newer block: the replaced block keeps
//! its bytes (and its id) until compaction. Each replacement appends one
//! WAL block holding the new records; the union of all WAL blocks read
//! at open reconstructs the tracker. Records are written only after the
//! replacing block is durable, so a crash can lose a supersession record
//! but never invent one.

use crate::{EngineError, EngineResult};
use emdb_codec::{encode_block, CodecConfig, KeyManager};
use emdb_store::{BlockIdAllocator, RawBlockStore};
use emdb_types::{BlockContent, BlockType, Encoding, SupersededRecord};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::debug;

/// Tracks which blocks have been replaced, and persists the records.
#[derive(Debug)]
pub struct SupersededBlockTracker {
    store: Arc<RawBlockStore>,
    ids: Arc<BlockIdAllocator>,
    records: Mutex<Vec<SupersededRecord>>,
}

impl SupersededBlockTracker {
    /// Rebuilds the tracker from every WAL block named in `wal_blocks`.
    /// Unreadable WAL blocks are skipped: losing supersession records
    /// only delays compaction, it never loses data.
    pub fn load(
        store: Arc<RawBlockStore>,
        ids: Arc<BlockIdAllocator>,
        wal_blocks: &[i64],
        keys: Option<&KeyManager>,
    ) -> Self {
        let mut records = Vec::new();
        for &block_id in wal_blocks {
            match store
                .read(block_id)
                .map_err(EngineError::from)
                .and_then(|b| Ok(emdb_codec::decode_block(&b, keys)?))
            {
                Ok(BlockContent::Wal(mut batch)) => records.append(&mut batch),
                Ok(_) | Err(_) => {
                    tracing::warn!(
                        target: "emdb::supersede",
                        block_id,
                        "skipping unreadable WAL block"
                    );
                }
            }
        }
        Self { store, ids, records: Mutex::new(records) }
    }

    /// An empty tracker for a fresh database.
    pub fn empty(store: Arc<RawBlockStore>, ids: Arc<BlockIdAllocator>) -> Self {
        Self { store, ids, records: Mutex::new(Vec::new()) }
    }

    /// Records a batch of supersessions, appending one WAL block.
    /// Returns the WAL block id for the next Metadata write. Call only
    /// after the replacing blocks are durable.
    pub fn record(&self, batch: Vec<SupersededRecord>) -> EngineResult<Option<i64>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let block_id = self.ids.next_id();
        let timestamp = batch.iter().map(|r| r.superseded_at).max().unwrap_or(0);
        let block = encode_block(
            &BlockContent::Wal(batch.clone()),
            BlockType::Wal,
            block_id,
            timestamp,
            Encoding::Json,
            CodecConfig::PLAIN,
            None,
        )?;
        self.store.append(&block)?;
        debug!(
            target: "emdb::supersede",
            wal_block = block_id,
            records = batch.len(),
            "recorded supersessions"
        );
        self.records.lock().extend(batch);
        Ok(Some(block_id))
    }

    /// All superseded block ids.
    pub fn superseded_ids(&self) -> HashSet<i64> {
        self.records.lock().iter().map(|r| r.block_id).collect()
    }

    /// Snapshot of the records.
    pub fn records(&self) -> Vec<SupersededRecord> {
        self.records.lock().clone()
    }

    /// Superseded blocks older than `cutoff_ms` that are still present
    /// in the store, i.e. the compaction candidates.
    pub fn reclaimable(&self, cutoff_ms: i64) -> Vec<SupersededRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.superseded_at <= cutoff_ms && self.store.contains(r.block_id))
            .cloned()
            .collect()
    }

    /// Bytes currently held by superseded blocks, for the compaction
    /// trigger.
    pub fn superseded_bytes(&self) -> u64 {
        let locations: HashMap<_, _> = self.store.locations();
        self.superseded_ids()
            .into_iter()
            .filter_map(|id| locations.get(&id).map(|l| l.len))
            .sum()
    }

    /// Forgets records for blocks that no longer exist (post-compaction).
    pub fn prune_missing(&self) {
        self.records.lock().retain(|r| self.store.contains(r.block_id));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use emdb_store::Block;

    fn fixture() -> (tempfile::TempDir, Arc<RawBlockStore>, Arc<BlockIdAllocator>) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = RawBlockStore::open(dir.path().join("s.emdb"), true, false).unwrap();
        (dir, Arc::new(store), Arc::new(BlockIdAllocator::new(1000)))
    }

    fn record(block_id: i64, at: i64) -> SupersededRecord {
        SupersededRecord {
            block_id,
            block_type: BlockType::Folder,
            superseded_at: at,
            reason: "folder update".into(),
        }
    }

    #[test]
    fn records_persist_across_reload() {
        let (_dir, store, ids) = fixture();
        let tracker = SupersededBlockTracker::empty(store.clone(), ids.clone());
        let wal_id = tracker.record(vec![record(5, 100), record(6, 200)]).unwrap().unwrap();

        let reloaded = SupersededBlockTracker::load(store, ids, &[wal_id], None);
        assert_eq!(reloaded.superseded_ids(), HashSet::from([5, 6]));
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let (_dir, store, ids) = fixture();
        let tracker = SupersededBlockTracker::empty(store.clone(), ids);
        assert_eq!(tracker.record(Vec::new()).unwrap(), None);
        assert_eq!(store.block_count(), 0);
    }

    #[test]
    fn reclaimable_honors_age_and_liveness() {
        let (_dir, store, ids) = fixture();
        // A real block that exists on disk.
        store
            .append(&Block::new(
                BlockType::Folder,
                5,
                0,
                emdb_types::Encoding::RawBytes,
                vec![1],
            ))
            .unwrap();
        let tracker = SupersededBlockTracker::empty(store, ids);
        tracker.record(vec![record(5, 100), record(999, 100)]).unwrap();

        // Block 999 was never written, so only 5 is reclaimable.
        let old_enough = tracker.reclaimable(150);
        assert_eq!(old_enough.len(), 1);
        assert_eq!(old_enough[0].block_id, 5);
        // Nothing is reclaimable before the age cutoff.
        assert!(tracker.reclaimable(50).is_empty());
    }
}
