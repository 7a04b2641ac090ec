//! Error types for the index layer.

use thiserror::Error;

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;

/// Failures surfaced by the index layer.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The index name is not registered.
    #[error("unknown index `{0}`")]
    UnknownIndex(String),
    /// A value held a different variant than the index's key type implies.
    #[error("key type mismatch in index `{index}`: expected {expected}")]
    KeyTypeMismatch {
        /// The index queried.
        index: String,
        /// The expected value variant.
        expected: &'static str,
    },
    /// A segment block failed its checksum or did not deserialize; it has
    /// been excluded from the tree.
    #[error("corrupt segment block {0}")]
    CorruptSegment(i64),
    /// Segment serialization failed.
    #[error("segment serialization failed: {0}")]
    Serialization(String),
    /// Underlying block store failure.
    #[error(transparent)]
    Store(#[from] emdb_store::StoreError),
    /// Codec pipeline failure.
    #[error(transparent)]
    Codec(#[from] emdb_codec::CodecError),
}
