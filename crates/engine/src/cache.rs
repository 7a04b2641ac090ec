//! Decoded-payload and folder caches.
//!
//! Two LRUs behind mutexes, the same shape as a caching oracle: the
//! payload cache keyed by block id holds fully decoded (decompressed,
//! decrypted) payload bytes and is bounded both by entry count and by
//! aggregate bytes; the folder cache holds current `FolderContent`
//! values by path. Invalidation is explicit, on supersession and on
//! migration.

use emdb_types::FolderContent;
use lru::LruCache;
use parking_lot::Mutex;
use std::{num::NonZeroUsize, sync::Arc};
use tracing::trace;

/// LRU of decoded block payloads, bounded by entries and bytes.
#[derive(Debug)]
pub struct PayloadCache {
    inner: Mutex<PayloadCacheInner>,
    max_bytes: u64,
}

#[derive(Debug)]
struct PayloadCacheInner {
    entries: LruCache<i64, Arc<Vec<u8>>>,
    bytes: u64,
}

impl PayloadCache {
    /// Creates a cache bounded by `max_entries` and `max_bytes`.
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(PayloadCacheInner { entries: LruCache::new(cap), bytes: 0 }),
            max_bytes,
        }
    }

    /// Returns the cached payload, refreshing its recency.
    pub fn get(&self, block_id: i64) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().entries.get(&block_id).cloned()
    }

    /// Inserts a decoded payload, evicting LRU entries until both bounds
    /// hold again.
    pub fn put(&self, block_id: i64, payload: Arc<Vec<u8>>) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.put(block_id, payload.clone()) {
            inner.bytes = inner.bytes.saturating_sub(old.len() as u64);
        }
        inner.bytes += payload.len() as u64;
        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((evicted, bytes)) => {
                    inner.bytes = inner.bytes.saturating_sub(bytes.len() as u64);
                    trace!(target: "emdb::cache", block_id = evicted, "evicted payload");
                }
                None => break,
            }
        }
    }

    /// Drops one entry (supersession).
    pub fn invalidate(&self, block_id: i64) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(&block_id) {
            inner.bytes = inner.bytes.saturating_sub(old.len() as u64);
        }
    }

    /// Drops everything (migration, compaction).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    /// Cached bytes, for stats and tests.
    pub fn bytes(&self) -> u64 {
        self.inner.lock().bytes
    }
}

/// LRU of current folder contents by path.
#[derive(Debug)]
pub struct FolderCache {
    inner: Mutex<LruCache<String, FolderContent>>,
}

impl FolderCache {
    /// Creates a cache of at most `max_entries` folders.
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is nonzero");
        Self { inner: Mutex::new(LruCache::new(cap)) }
    }

    /// Returns a cached folder, refreshing its recency.
    pub fn get(&self, path: &str) -> Option<FolderContent> {
        self.inner.lock().get(path).cloned()
    }

    /// Caches a folder's current content.
    pub fn put(&self, path: String, content: FolderContent) {
        self.inner.lock().put(path, content);
    }

    /// Drops one folder (mutation or supersession).
    pub fn invalidate(&self, path: &str) {
        self.inner.lock().pop(path);
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
