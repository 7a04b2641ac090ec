//! Raw append-only block store.
//!
//! A database file is a sequence of self-describing, checksummed blocks
//! (see [`block`]). This crate owns the file: it appends encoded blocks at
//! EOF, reads them back by id through an in-memory location index, and
//! rebuilds that index on open with a corruption-tolerant forward scan
//! (see [`scan`]). Everything above the raw framing, from payload
//! encoding and compression to batching, lives in higher crates.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod block;
pub use block::{
    Block, BlockHeader, ExtendedHeader, BLOCK_MAGIC, FRAMING_VERSION, HEADER_LEN,
    HEADER_WITH_CHECKSUM_LEN, MIN_BLOCK_LEN, TRAILER_LEN,
};

pub mod errors;
pub use errors::{StoreError, StoreResult};

pub mod ids;
pub use ids::BlockIdAllocator;

pub mod scan;
pub use scan::{scan_file, ScanReport, ScannedBlock};

pub mod store;
pub use store::{BlockLocation, RawBlockStore};
