//! The write and read pipelines tying encoding, compression, and
//! encryption together.
//!
//! Write order is serialize → compress → encrypt; read order is the
//! reverse. Compression that saves less than 5% is discarded and the
//! flags report `None`, so pathological payloads never pay double.

use crate::{
    compression, crypto,
    crypto::BlockAad,
    encoding::{decode_content, encode_content},
    CodecError, CodecResult, KeyManager,
};
use emdb_store::{Block, ExtendedHeader};
use emdb_types::{
    BlockContent, BlockFlags, BlockType, CompressionAlgorithm, Encoding, EncryptionAlgorithm,
};
use tracing::trace;

/// Compression is kept only below this ratio of the original size.
const COMPRESSION_KEEP_RATIO: f64 = 0.95;

/// Pipeline configuration for one block write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecConfig {
    /// Compression to attempt.
    pub compression: CompressionAlgorithm,
    /// Encryption to apply.
    pub encryption: EncryptionAlgorithm,
}

impl CodecConfig {
    /// No compression, no encryption.
    pub const PLAIN: Self =
        Self { compression: CompressionAlgorithm::None, encryption: EncryptionAlgorithm::None };
}

/// Runs the full write pipeline and produces a ready-to-append [`Block`].
///
/// `block_type` must agree with the content for structured variants; raw
/// content may be stored under any of the byte-carrying block types.
pub fn encode_block(
    content: &BlockContent,
    block_type: BlockType,
    block_id: i64,
    timestamp: i64,
    encoding: Encoding,
    config: CodecConfig,
    keys: Option<&KeyManager>,
) -> CodecResult<Block> {
    if !matches!(content, BlockContent::Raw(_)) && content.block_type() != block_type {
        return Err(CodecError::EncodingMismatch(format!(
            "content for {:?} cannot be stored under {block_type:?}",
            content.block_type()
        )));
    }

    let plain = encode_content(content, encoding)?;
    let uncompressed_size = plain.len() as u32;

    // Compress, keeping the result only when it pays for itself.
    let (mut payload, effective_compression) =
        if config.compression != CompressionAlgorithm::None && !plain.is_empty() {
            let compressed = compression::compress(config.compression, &plain)?;
            let ratio = compressed.len() as f64 / plain.len() as f64;
            if ratio >= COMPRESSION_KEEP_RATIO {
                trace!(
                    target: "emdb::codec",
                    block_id,
                    ratio,
                    "compression not worthwhile, storing raw"
                );
                (plain, CompressionAlgorithm::None)
            } else {
                (compressed, config.compression)
            }
        } else {
            (plain, CompressionAlgorithm::None)
        };

    // Encrypt. Empty payloads skip the cipher but keep the header fields.
    let mut iv = [0u8; 16];
    let mut auth_tag = Vec::new();
    let mut key_id = 0;
    if config.encryption != EncryptionAlgorithm::None {
        let keys = keys.ok_or(CodecError::NotUnlocked)?;
        let (key, id) = keys.generate_block_key(block_id, config.encryption)?;
        key_id = id;
        if !payload.is_empty() {
            let aad = BlockAad { block_id, block_type, timestamp };
            let sealed = crypto::encrypt(config.encryption, &key, aad, &payload)?;
            payload = sealed.ciphertext;
            iv = sealed.iv;
            auth_tag = sealed.auth_tag;
        }
    }

    let flags = BlockFlags::new(effective_compression, config.encryption);
    let ext = (flags.is_compressed() || flags.is_encrypted())
        .then_some(ExtendedHeader { uncompressed_size, iv, auth_tag, key_id });

    Ok(Block { block_type, flags, encoding, timestamp, block_id, ext, payload })
}

/// Reverses the codec pipeline, returning the serialized content bytes.
pub fn decode_block_raw(block: &Block, keys: Option<&KeyManager>) -> CodecResult<Vec<u8>> {
    let mut bytes = block.payload.clone();

    if block.flags.is_encrypted() && !bytes.is_empty() {
        let ext = block.ext.as_ref().ok_or_else(|| {
            CodecError::DeserializationFailed("encrypted block without extended header".into())
        })?;
        let keys = keys.ok_or(CodecError::NotUnlocked)?;
        let key = keys.get_block_key(block.block_id, ext.key_id, block.flags.encryption)?;
        let aad = BlockAad {
            block_id: block.block_id,
            block_type: block.block_type,
            timestamp: block.timestamp,
        };
        bytes =
            crypto::decrypt(block.flags.encryption, &key, aad, &bytes, &ext.iv, &ext.auth_tag)?;
    }

    if block.flags.is_compressed() {
        let ext = block.ext.as_ref().ok_or_else(|| {
            CodecError::DeserializationFailed("compressed block without extended header".into())
        })?;
        bytes =
            compression::decompress(block.flags.compression, &bytes, ext.uncompressed_size as usize)?;
    }

    Ok(bytes)
}

/// Reverses the codec pipeline and deserializes the content.
pub fn decode_block(block: &Block, keys: Option<&KeyManager>) -> CodecResult<BlockContent> {
    let bytes = decode_block_raw(block, keys)?;
    decode_content(block.block_type, block.encoding, &bytes)
}
