//! Persistent ordered key/value indexes.
//!
//! Each named index is a small log-structured tree: a mutable in-memory
//! [`Memtable`] in front of a stack of immutable sorted [`Segment`]s, each
//! segment persisted as one `ZoneTreeSegment_KV` block in the main file.
//! Lookups go memtable first, then segments young to old; a tombstone
//! short-circuits to not-found. `merge` folds the segment stack into one
//! and drops tombstones; the replaced segment blocks are reported back to
//! the caller for supersession tracking.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod errors;
pub use errors::{IndexError, IndexResult};

pub mod value;
pub use value::{IndexValue, Posting};

pub mod memtable;
pub use memtable::Memtable;

pub mod segment;
pub use segment::Segment;

pub mod store;
pub use store::{FlushedSegment, IndexStore, MergeOutcome};
