//! The engine's wire-visible error taxonomy.
//!
//! Lower layers keep their own error enums; everything crossing the
//! public API is mapped into [`EngineError`] here, so callers see one
//! closed set regardless of which layer failed.

use emdb_codec::CodecError;
use emdb_index::IndexError;
use emdb_store::StoreError;
use emdb_types::DatabaseVersion;
use thiserror::Error;

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced by the database façade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The named entity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A block header failed validation.
    #[error("corrupt header: {0}")]
    CorruptHeader(String),
    /// A block payload failed validation.
    #[error("corrupt payload in block {0}")]
    CorruptPayload(i64),
    /// Filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The file's format version cannot be opened by this build.
    #[error("unsupported database version {0}")]
    UnsupportedVersion(DatabaseVersion),
    /// The encoding is reserved or unknown.
    #[error("unsupported encoding")]
    UnsupportedEncoding,
    /// The value does not fit the requested encoding.
    #[error("encoding mismatch: {0}")]
    EncodingMismatch(String),
    /// The compressor reported an error.
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    /// The decompressor reported an error.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
    /// AEAD or HMAC verification failed.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// The key generation needed by a block is unavailable.
    #[error("wrong key for block {0}")]
    WrongKey(i64),
    /// Encryption was requested while the key manager is locked.
    #[error("encryption is locked")]
    NotUnlocked,
    /// The operation observed its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,
    /// Another process holds the database.
    #[error("database is locked by another process ({0})")]
    AlreadyLocked(String),
    /// The file requires migration before it can be opened.
    #[error("migration required: file is {file}, this build writes {current}")]
    MigrationRequired {
        /// Version found on disk.
        file: DatabaseVersion,
        /// Version this build writes.
        current: DatabaseVersion,
    },
    /// A migration run failed partway; the original file is untouched.
    #[error("migration failed: {0}")]
    MigrationFailed(String),
    /// The caller broke an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(format!("block {id}")),
            StoreError::CorruptHeader { block_id, reason } => {
                Self::CorruptHeader(format!("block {block_id}: {reason}"))
            }
            StoreError::CorruptPayload(id) => Self::CorruptPayload(id),
            StoreError::DuplicateBlockId(id) => {
                Self::InvalidArgument(format!("block id {id} already exists"))
            }
            StoreError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            StoreError::AlreadyLocked(holder) => Self::AlreadyLocked(holder),
            StoreError::ReadOnly => Self::InvalidArgument("database is read-only".into()),
            StoreError::Io(e) => Self::Io(e),
        }
    }
}

impl From<CodecError> for EngineError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::SerializationFailed(m) | CodecError::DeserializationFailed(m) => {
                Self::EncodingMismatch(m)
            }
            CodecError::CompressionFailed(m) => Self::CompressionFailed(m),
            CodecError::DecompressionFailed(m) => Self::DecompressionFailed(m),
            CodecError::AuthenticationFailed => Self::AuthenticationFailed,
            CodecError::WrongKey { block_id, .. } => Self::WrongKey(block_id),
            CodecError::NotUnlocked => Self::NotUnlocked,
            CodecError::UnsupportedEncoding(_) => Self::UnsupportedEncoding,
            CodecError::EncodingMismatch(m) => Self::EncodingMismatch(m),
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::UnknownIndex(name) => Self::NotFound(format!("index `{name}`")),
            IndexError::KeyTypeMismatch { index, expected } => Self::InvalidArgument(format!(
                "index `{index}` holds a different value type than {expected}"
            )),
            IndexError::CorruptSegment(id) => Self::CorruptPayload(id),
            IndexError::Serialization(m) => Self::EncodingMismatch(m),
            IndexError::Store(e) => e.into(),
            IndexError::Codec(e) => e.into(),
        }
    }
}
