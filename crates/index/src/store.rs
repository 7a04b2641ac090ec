//! The index store: named trees persisted through the block store.

use crate::{IndexError, IndexResult, IndexValue, Memtable, Posting, Segment};
use emdb_codec::{decode_block_raw, encode_block, CodecConfig, KeyManager};
use emdb_store::{BlockIdAllocator, RawBlockStore};
use emdb_types::{BlockContent, BlockType, EmailId, Encoding};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

/// Default memtable size that triggers a segment flush.
pub const DEFAULT_FLUSH_THRESHOLD_BYTES: usize = 1 << 20;

/// A segment newly written by a flush; the caller records it in Metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedSegment {
    /// Index the segment belongs to.
    pub index: String,
    /// Block the segment was written as.
    pub block_id: i64,
}

/// Result of merging an index's segment stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Index that was merged.
    pub index: String,
    /// The merged replacement segment, absent when everything merged away.
    pub new_segment: Option<i64>,
    /// Segment blocks replaced by the merge, for supersession tracking.
    pub superseded: Vec<i64>,
}

#[derive(Debug, Default)]
struct Tree {
    memtable: Memtable,
    /// Youngest first.
    segments: Vec<Segment>,
}

impl Tree {
    fn get(&self, key: &[u8]) -> Option<IndexValue> {
        if let Some(hit) = self.memtable.get(key) {
            return hit.clone();
        }
        for segment in &self.segments {
            if let Some(hit) = segment.get(key) {
                return hit.clone();
            }
        }
        None
    }
}

/// Named ordered key/value trees, persisted as `ZoneTreeSegment_KV`
/// blocks. Writers go through the per-store write lock; the in-memory
/// segment commit under that lock is the linearization point readers
/// observe.
#[derive(Debug)]
pub struct IndexStore {
    store: Arc<RawBlockStore>,
    ids: Arc<BlockIdAllocator>,
    codec: CodecConfig,
    keys: Option<Arc<KeyManager>>,
    flush_threshold: usize,
    trees: RwLock<BTreeMap<String, Tree>>,
}

impl IndexStore {
    /// Creates an empty index store writing through `store`.
    pub fn new(
        store: Arc<RawBlockStore>,
        ids: Arc<BlockIdAllocator>,
        codec: CodecConfig,
        keys: Option<Arc<KeyManager>>,
    ) -> Self {
        Self {
            store,
            ids,
            codec,
            keys,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD_BYTES,
            trees: RwLock::new(BTreeMap::new()),
        }
    }

    /// Overrides the flush threshold (tests use tiny ones).
    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    /// Registers an index, loading its persisted segments. `segment_ids`
    /// come from the newest Metadata block, youngest last. A segment that
    /// fails to read or deserialize is excluded from the tree; older
    /// segments keep answering for its keys.
    pub fn open_tree(&self, name: &str, segment_ids: &[i64]) -> IndexResult<()> {
        let mut segments = Vec::with_capacity(segment_ids.len());
        // Youngest-last on disk, youngest-first in memory.
        for &block_id in segment_ids.iter().rev() {
            match self.load_segment(block_id) {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    warn!(
                        target: "emdb::index",
                        index = name,
                        block_id,
                        error = %e,
                        "excluding unreadable segment from tree"
                    );
                }
            }
        }
        info!(
            target: "emdb::index",
            index = name,
            segments = segments.len(),
            "opened index tree"
        );
        self.trees
            .write()
            .insert(name.to_owned(), Tree { memtable: Memtable::new(), segments });
        Ok(())
    }

    fn load_segment(&self, block_id: i64) -> IndexResult<Segment> {
        let block = self.store.read(block_id)?;
        if block.block_type != BlockType::ZoneTreeSegmentKv {
            return Err(IndexError::CorruptSegment(block_id));
        }
        let bytes = decode_block_raw(&block, self.keys.as_deref())?;
        Segment::from_payload(block_id, &bytes)
    }

    /// Inserts or replaces `key` in `index`. The tree is created on first
    /// touch.
    pub fn upsert(&self, index: &str, key: &[u8], value: IndexValue) -> IndexResult<()> {
        let mut trees = self.trees.write();
        trees.entry(index.to_owned()).or_default().memtable.upsert(key.to_vec(), value);
        Ok(())
    }

    /// Writes a delete tombstone for `key`.
    pub fn delete(&self, index: &str, key: &[u8]) -> IndexResult<()> {
        let mut trees = self.trees.write();
        trees.entry(index.to_owned()).or_default().memtable.delete(key.to_vec());
        Ok(())
    }

    /// Point lookup: memtable, then segments young to old. A tombstone
    /// short-circuits to `None`.
    pub fn get(&self, index: &str, key: &[u8]) -> IndexResult<Option<IndexValue>> {
        Ok(self.trees.read().get(index).and_then(|tree| tree.get(key)))
    }

    /// True when any entry, live or tombstone, exists for `key`.
    /// Recovery uses this to tell "never indexed" from "deleted".
    pub fn has_entry(&self, index: &str, key: &[u8]) -> bool {
        self.trees.read().get(index).is_some_and(|tree| {
            tree.memtable.get(key).is_some() || tree.segments.iter().any(|s| s.get(key).is_some())
        })
    }

    /// Typed lookup for single-email indexes.
    pub fn get_email(&self, index: &str, key: &[u8]) -> IndexResult<Option<EmailId>> {
        match self.get(index, key)? {
            None => Ok(None),
            Some(IndexValue::Email(id)) => Ok(Some(id)),
            Some(_) => Err(IndexError::KeyTypeMismatch { index: index.into(), expected: "Email" }),
        }
    }

    /// Typed lookup for list indexes.
    pub fn get_email_list(&self, index: &str, key: &[u8]) -> IndexResult<Option<Vec<EmailId>>> {
        match self.get(index, key)? {
            None => Ok(None),
            Some(IndexValue::EmailList(ids)) => Ok(Some(ids)),
            Some(_) => {
                Err(IndexError::KeyTypeMismatch { index: index.into(), expected: "EmailList" })
            }
        }
    }

    /// Typed lookup for the term index.
    pub fn get_postings(&self, index: &str, key: &[u8]) -> IndexResult<Option<Vec<Posting>>> {
        match self.get(index, key)? {
            None => Ok(None),
            Some(IndexValue::Postings(p)) => Ok(Some(p)),
            Some(_) => {
                Err(IndexError::KeyTypeMismatch { index: index.into(), expected: "Postings" })
            }
        }
    }

    /// Merged ascending iteration over live entries with keys in
    /// `[from, to)`; `None` bounds are open. Tombstones are skipped.
    pub fn range(
        &self,
        index: &str,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
    ) -> IndexResult<Vec<(Vec<u8>, IndexValue)>> {
        let trees = self.trees.read();
        let Some(tree) = trees.get(index) else {
            return Ok(Vec::new());
        };

        let in_range = |key: &[u8]| {
            from.map_or(true, |f| key >= f) && to.map_or(true, |t| key < t)
        };

        // Oldest to youngest so newer entries overwrite older ones, the
        // memtable last of all.
        let mut merged: BTreeMap<Vec<u8>, Option<IndexValue>> = BTreeMap::new();
        for segment in tree.segments.iter().rev() {
            for (key, value) in segment.iter() {
                if in_range(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in tree.memtable.iter() {
            if in_range(key) {
                merged.insert(key.clone(), value.clone());
            }
        }

        Ok(merged.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect())
    }

    /// Freezes `index`'s memtable into a new segment block. No-op on an
    /// empty memtable.
    pub fn flush(&self, index: &str, now_ms: i64) -> IndexResult<Option<FlushedSegment>> {
        let mut trees = self.trees.write();
        let Some(tree) = trees.get_mut(index) else {
            return Ok(None);
        };
        if tree.memtable.is_empty() {
            return Ok(None);
        }

        let block_id = self.ids.next_id();
        let segment = Segment::from_sorted(block_id, tree.memtable.drain_sorted());
        self.write_segment(&segment, now_ms)?;
        debug!(
            target: "emdb::index",
            index,
            block_id,
            entries = segment.len(),
            "flushed memtable to segment"
        );
        tree.segments.insert(0, segment);
        Ok(Some(FlushedSegment { index: index.to_owned(), block_id }))
    }

    fn write_segment(&self, segment: &Segment, now_ms: i64) -> IndexResult<()> {
        let payload = segment.to_payload()?;
        let block = encode_block(
            &BlockContent::Raw(payload),
            BlockType::ZoneTreeSegmentKv,
            segment.block_id,
            now_ms,
            Encoding::RawBytes,
            self.codec,
            self.keys.as_deref(),
        )?;
        self.store.append(&block)?;
        Ok(())
    }

    /// Flushes every tree whose memtable crossed the threshold.
    pub fn flush_if_needed(&self, now_ms: i64) -> IndexResult<Vec<FlushedSegment>> {
        let over: Vec<String> = {
            let trees = self.trees.read();
            trees
                .iter()
                .filter(|(_, t)| t.memtable.approx_bytes() >= self.flush_threshold)
                .map(|(name, _)| name.clone())
                .collect()
        };
        let mut flushed = Vec::new();
        for name in over {
            flushed.extend(self.flush(&name, now_ms)?);
        }
        Ok(flushed)
    }

    /// Flushes every non-empty memtable (shutdown, metadata persist).
    pub fn flush_all(&self, now_ms: i64) -> IndexResult<Vec<FlushedSegment>> {
        let names: Vec<String> = self.trees.read().keys().cloned().collect();
        let mut flushed = Vec::new();
        for name in names {
            flushed.extend(self.flush(&name, now_ms)?);
        }
        Ok(flushed)
    }

    /// Folds `index`'s whole segment stack into one new segment,
    /// dropping tombstones (safe because every older run participates).
    /// Returns `None` when there is nothing to merge.
    pub fn merge(&self, index: &str, now_ms: i64) -> IndexResult<Option<MergeOutcome>> {
        let mut trees = self.trees.write();
        let Some(tree) = trees.get_mut(index) else {
            return Ok(None);
        };
        if tree.segments.len() < 2 {
            return Ok(None);
        }

        let superseded: Vec<i64> = tree.segments.iter().map(|s| s.block_id).collect();
        let mut merged: BTreeMap<Vec<u8>, Option<IndexValue>> = BTreeMap::new();
        for segment in tree.segments.iter().rev() {
            for (key, value) in segment.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        let live: Vec<(Vec<u8>, Option<IndexValue>)> =
            merged.into_iter().filter(|(_, v)| v.is_some()).collect();

        let new_segment = if live.is_empty() {
            tree.segments.clear();
            None
        } else {
            let block_id = self.ids.next_id();
            let segment = Segment::from_sorted(block_id, live);
            self.write_segment(&segment, now_ms)?;
            tree.segments = vec![segment];
            Some(block_id)
        };

        info!(
            target: "emdb::index",
            index,
            merged = superseded.len(),
            new_segment,
            "merged segment stack"
        );
        Ok(Some(MergeOutcome { index: index.to_owned(), new_segment, superseded }))
    }

    /// Segment roots per index, youngest last, for the Metadata block.
    pub fn roots(&self) -> BTreeMap<String, Vec<i64>> {
        self.trees
            .read()
            .iter()
            .map(|(name, tree)| {
                (name.clone(), tree.segments.iter().rev().map(|s| s.block_id).collect())
            })
            .collect()
    }

    /// Live entry count of one index (memtable + segments, after
    /// shadowing and tombstones).
    pub fn live_len(&self, index: &str) -> usize {
        self.range(index, None, None).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn fixture() -> (tempfile::TempDir, IndexStore) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = RawBlockStore::open(dir.path().join("i.emdb"), true, false).unwrap();
        let ids = Arc::new(BlockIdAllocator::new(100));
        let index =
            IndexStore::new(Arc::new(store), ids, CodecConfig::PLAIN, None).with_flush_threshold(64);
        (dir, index)
    }

    fn email(n: i64) -> IndexValue {
        IndexValue::Email(EmailId::new(n, 0))
    }

    #[test]
    fn upsert_get_without_flush() {
        let (_dir, index) = fixture();
        index.upsert("message-id", b"<a@x>", email(1)).unwrap();
        assert_eq!(index.get("message-id", b"<a@x>").unwrap(), Some(email(1)));
        assert_eq!(index.get("message-id", b"<b@x>").unwrap(), None);
    }

    #[test]
    fn tombstone_shadows_older_segment() {
        let (_dir, index) = fixture();
        index.upsert("t", b"k", email(1)).unwrap();
        index.flush("t", NOW).unwrap().unwrap();
        index.delete("t", b"k").unwrap();
        assert_eq!(index.get("t", b"k").unwrap(), None);
        // Still gone after the tombstone itself lands in a segment.
        index.flush("t", NOW).unwrap().unwrap();
        assert_eq!(index.get("t", b"k").unwrap(), None);
    }

    #[test]
    fn young_segment_shadows_old() {
        let (_dir, index) = fixture();
        index.upsert("t", b"k", email(1)).unwrap();
        index.flush("t", NOW).unwrap().unwrap();
        index.upsert("t", b"k", email(2)).unwrap();
        index.flush("t", NOW).unwrap().unwrap();
        assert_eq!(index.get("t", b"k").unwrap(), Some(email(2)));
    }

    #[test]
    fn segments_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i.emdb");
        let roots;
        {
            let (store, _) = RawBlockStore::open(&path, true, false).unwrap();
            let ids = Arc::new(BlockIdAllocator::new(100));
            let index = IndexStore::new(Arc::new(store), ids, CodecConfig::PLAIN, None);
            index.upsert("m", b"one", email(1)).unwrap();
            index.upsert("m", b"two", email(2)).unwrap();
            index.flush("m", NOW).unwrap().unwrap();
            roots = index.roots();
        }
        let (store, _) = RawBlockStore::open(&path, false, false).unwrap();
        let ids = Arc::new(BlockIdAllocator::new(1000));
        let index = IndexStore::new(Arc::new(store), ids, CodecConfig::PLAIN, None);
        index.open_tree("m", &roots["m"]).unwrap();
        assert_eq!(index.get("m", b"one").unwrap(), Some(email(1)));
        assert_eq!(index.get("m", b"two").unwrap(), Some(email(2)));
    }

    #[test]
    fn range_merges_and_skips_tombstones() {
        let (_dir, index) = fixture();
        index.upsert("t", b"a", email(1)).unwrap();
        index.upsert("t", b"b", email(2)).unwrap();
        index.flush("t", NOW).unwrap().unwrap();
        index.upsert("t", b"c", email(3)).unwrap();
        index.delete("t", b"b").unwrap();

        let all = index.range("t", None, None).unwrap();
        assert_eq!(
            all,
            vec![(b"a".to_vec(), email(1)), (b"c".to_vec(), email(3))]
        );
        let bounded = index.range("t", Some(b"b"), Some(b"d")).unwrap();
        assert_eq!(bounded, vec![(b"c".to_vec(), email(3))]);
    }

    #[test]
    fn merge_collapses_stack_and_drops_tombstones() {
        let (_dir, index) = fixture();
        index.upsert("t", b"a", email(1)).unwrap();
        index.flush("t", NOW).unwrap().unwrap();
        index.upsert("t", b"b", email(2)).unwrap();
        index.flush("t", NOW).unwrap().unwrap();
        index.delete("t", b"a").unwrap();
        index.flush("t", NOW).unwrap().unwrap();

        let outcome = index.merge("t", NOW).unwrap().unwrap();
        assert_eq!(outcome.superseded.len(), 3);
        assert!(outcome.new_segment.is_some());
        assert_eq!(index.get("t", b"a").unwrap(), None);
        assert_eq!(index.get("t", b"b").unwrap(), Some(email(2)));
        assert_eq!(index.roots()["t"], vec![outcome.new_segment.unwrap()]);
    }

    #[test]
    fn key_type_mismatch_is_reported() {
        let (_dir, index) = fixture();
        index.upsert("m", b"k", IndexValue::EmailList(vec![EmailId::new(1, 0)])).unwrap();
        assert!(matches!(
            index.get_email("m", b"k"),
            Err(IndexError::KeyTypeMismatch { .. })
        ));
    }

    #[test]
    fn flush_if_needed_honors_threshold() {
        let (_dir, index) = fixture();
        // Threshold is 64 bytes; a couple of entries cross it.
        index.upsert("t", b"a-rather-long-key-0", email(1)).unwrap();
        index.upsert("t", b"a-rather-long-key-1", email(2)).unwrap();
        index.upsert("t", b"a-rather-long-key-2", email(3)).unwrap();
        let flushed = index.flush_if_needed(NOW).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].index, "t");
    }
}
