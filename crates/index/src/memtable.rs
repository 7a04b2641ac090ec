//! The mutable in-memory front of an index tree.

use crate::IndexValue;
use std::collections::BTreeMap;

/// An ordered write buffer. `None` values are delete tombstones, which
/// must survive until merge so they can shadow older segments.
#[derive(Debug, Default)]
pub struct Memtable {
    entries: BTreeMap<Vec<u8>, Option<IndexValue>>,
    approx_bytes: usize,
}

impl Memtable {
    /// An empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a live entry.
    pub fn upsert(&mut self, key: Vec<u8>, value: IndexValue) {
        self.insert(key, Some(value));
    }

    /// Inserts a tombstone.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.insert(key, None);
    }

    fn insert(&mut self, key: Vec<u8>, value: Option<IndexValue>) {
        let key_len = key.len();
        let new_weight = Self::value_weight(&value);
        match self.entries.insert(key, value) {
            Some(old) => {
                // Key bytes were already accounted for by the first insert.
                self.approx_bytes =
                    self.approx_bytes.saturating_sub(Self::value_weight(&old)) + new_weight;
            }
            None => self.approx_bytes += key_len + new_weight,
        }
    }

    fn value_weight(value: &Option<IndexValue>) -> usize {
        match value {
            None => 1,
            Some(IndexValue::Email(_)) => 12,
            Some(IndexValue::EmailList(v)) => 12 * v.len().max(1),
            Some(IndexValue::Postings(v)) => 17 * v.len().max(1),
        }
    }

    /// Looks up a key. `Some(None)` is a tombstone; `None` means the
    /// memtable has no opinion and older segments decide.
    pub fn get(&self, key: &[u8]) -> Option<&Option<IndexValue>> {
        self.entries.get(key)
    }

    /// Ascending iteration over all entries, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<IndexValue>)> {
        self.entries.iter()
    }

    /// Entry count, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rough heap footprint used for the flush decision.
    pub const fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    /// Drains everything into a sorted entry list for segment freezing.
    pub fn drain_sorted(&mut self) -> Vec<(Vec<u8>, Option<IndexValue>)> {
        self.approx_bytes = 0;
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use emdb_types::EmailId;

    #[test]
    fn upsert_get_delete() {
        let mut mt = Memtable::new();
        mt.upsert(b"a".to_vec(), IndexValue::Email(EmailId::new(1, 0)));
        assert_eq!(
            mt.get(b"a"),
            Some(&Some(IndexValue::Email(EmailId::new(1, 0))))
        );
        mt.delete(b"a".to_vec());
        assert_eq!(mt.get(b"a"), Some(&None));
        assert_eq!(mt.get(b"b"), None);
    }

    #[test]
    fn drain_is_sorted_and_resets() {
        let mut mt = Memtable::new();
        mt.upsert(b"b".to_vec(), IndexValue::Email(EmailId::new(2, 0)));
        mt.upsert(b"a".to_vec(), IndexValue::Email(EmailId::new(1, 0)));
        let drained = mt.drain_sorted();
        assert_eq!(drained[0].0, b"a");
        assert_eq!(drained[1].0, b"b");
        assert!(mt.is_empty());
        assert_eq!(mt.approx_bytes(), 0);
    }
}
