//! Monotone block id allocation.

use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out fresh block ids, strictly increasing within a process.
///
/// Seeded from `max(scanned ids) + 1` on open, so ids never collide with
/// anything live on disk. Superseded blocks keep their ids; an id is
/// never reused.
#[derive(Debug)]
pub struct BlockIdAllocator {
    next: AtomicI64,
}

impl BlockIdAllocator {
    /// Creates an allocator whose first id is `max(1, seed)`.
    pub fn new(seed: i64) -> Self {
        Self { next: AtomicI64::new(seed.max(1)) }
    }

    /// Seeds from a scan: the first fresh id is one past the largest
    /// observed.
    pub fn after(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::new(ids.into_iter().max().map_or(1, |max| max + 1))
    }

    /// Returns the next fresh id.
    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call will return.
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn never_hands_out_the_reserved_header_id() {
        let ids = BlockIdAllocator::new(0);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn seeds_past_scanned_ids() {
        let ids = BlockIdAllocator::after([5, 99, 12]);
        assert_eq!(ids.next_id(), 100);
        assert_eq!(ids.next_id(), 101);
    }

    #[test]
    fn empty_scan_starts_at_one() {
        let ids = BlockIdAllocator::after([]);
        assert_eq!(ids.next_id(), 1);
    }
}
