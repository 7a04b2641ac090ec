//! Error types for the raw block store.

use thiserror::Error;

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures surfaced by the raw block store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested block id is not in the location index.
    #[error("block {0} not found")]
    NotFound(i64),
    /// The header checksum or a header field failed validation.
    #[error("corrupt header for block {block_id}: {reason}")]
    CorruptHeader {
        /// Offending block id, when it could be read.
        block_id: i64,
        /// What failed.
        reason: String,
    },
    /// The trailer checksum did not match the stored bytes.
    #[error("corrupt payload for block {0}: trailer checksum mismatch")]
    CorruptPayload(i64),
    /// A uniqueness-requiring append hit an existing live id.
    #[error("block id {0} already exists")]
    DuplicateBlockId(i64),
    /// The caller broke an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Another process holds the database lock.
    #[error("database is locked by another process ({0})")]
    AlreadyLocked(String),
    /// The store was opened read-only.
    #[error("store is read-only")]
    ReadOnly,
    /// Filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartialEq for StoreError {
    fn eq(&self, other: &Self) -> bool {
        use StoreError::*;
        match (self, other) {
            (NotFound(a), NotFound(b)) | (CorruptPayload(a), CorruptPayload(b)) => a == b,
            (DuplicateBlockId(a), DuplicateBlockId(b)) => a == b,
            (CorruptHeader { block_id: a, .. }, CorruptHeader { block_id: b, .. }) => a == b,
            (InvalidArgument(a), InvalidArgument(b)) => a == b,
            (AlreadyLocked(_), AlreadyLocked(_)) | (ReadOnly, ReadOnly) => true,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
