//! Error types for the codec pipeline.

use emdb_types::Encoding;
use thiserror::Error;

/// Convenience alias for codec results.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failures surfaced by the codec pipeline and key manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The content could not be serialized.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    /// The serialized bytes could not be decoded into content.
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    /// The compressor reported an error.
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    /// The decompressor reported an error or produced wrong output.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
    /// AEAD tag or HMAC verification failed. Fatal for this block.
    #[error("authentication failed: ciphertext or associated data does not match the key")]
    AuthenticationFailed,
    /// The key generation named by the block is not available.
    #[error("wrong key for block {block_id} (key generation {key_id})")]
    WrongKey {
        /// The block that could not be decrypted.
        block_id: i64,
        /// The generation it was encrypted under.
        key_id: u32,
    },
    /// The key manager is locked.
    #[error("key manager is not unlocked")]
    NotUnlocked,
    /// The encoding is reserved or unknown to this build.
    #[error("unsupported encoding {0:?}")]
    UnsupportedEncoding(Encoding),
    /// The value does not fit the requested encoding.
    #[error("encoding mismatch: {0}")]
    EncodingMismatch(String),
}
