//! Block framing v1: self-describing, double-checksummed records.
//!
//! # On-disk layout (all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic            = 0xEDB10CC5
//!    4      2   version          = 1 (bumped on layout change)
//!    6      1   type             BlockType wire byte
//!    7      1   flags            compression/encryption + mirror bits
//!    8      1   encoding         RawBytes/Json/Protobuf/CapnProto
//!    9      8   timestamp        creator clock, Unix milliseconds (i64)
//!   17      8   block_id         creator-assigned id (i64)
//!   25      4   payload_len      payload bytes as stored on disk (u32)
//!   29      2   ext_header_len   0 when absent (u16)
//!   31      6   reserved         zero on write, ignored on read
//!   37      4   header_checksum  CRC32 of bytes [0..37]
//!   41      …   extended header  (ext_header_len bytes, see below)
//!    …      …   payload
//!    …      8   trailer_checksum CRC64/XZ of everything above it
//! ```
//!
//! Extended header, present iff `ext_header_len > 0`:
//!
//! ```text
//!    0      4   uncompressed_size  (u32)
//!    4     16   iv                 nonce, zero-padded to 16 bytes
//!   20      …   auth_tag           ext_header_len − 24 bytes
//!    …      4   key_id             key generation (u32)
//! ```
//!
//! # Validation order
//!
//! `header_checksum` must hold before any field beyond it is trusted;
//! `trailer_checksum` must hold before the payload is returned. A block
//! failing either check is treated as nonexistent, never as fatal to the
//! file.

use crate::errors::{StoreError, StoreResult};
use emdb_types::{BlockFlags, BlockType, Encoding};

/// On-disk magic marking every block start.
pub const BLOCK_MAGIC: u32 = 0xEDB1_0CC5;

/// Current framing version.
pub const FRAMING_VERSION: u16 = 1;

/// Checksummed header prefix length.
pub const HEADER_LEN: usize = 37;

/// Header prefix plus its CRC32.
pub const HEADER_WITH_CHECKSUM_LEN: usize = HEADER_LEN + 4;

/// Trailing CRC64 length.
pub const TRAILER_LEN: usize = 8;

/// Smallest possible block: header, checksum, empty payload, trailer.
pub const MIN_BLOCK_LEN: usize = HEADER_WITH_CHECKSUM_LEN + TRAILER_LEN;

/// Fixed extended-header bytes around the variable auth tag.
const EXT_FIXED_LEN: usize = 4 + 16 + 4;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_XZ);

/// Computes the trailer checksum over already-encoded block bytes.
pub(crate) fn trailer_checksum(bytes: &[u8]) -> u64 {
    CRC64.checksum(bytes)
}

/// The parsed fixed header of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Framing version the block was written with.
    pub version: u16,
    /// Block role.
    pub block_type: BlockType,
    /// Codec pipeline flags.
    pub flags: BlockFlags,
    /// Payload serialization encoding.
    pub encoding: Encoding,
    /// Creator-supplied Unix-ms timestamp.
    pub timestamp: i64,
    /// Creator-supplied block id.
    pub block_id: i64,
    /// Payload bytes as stored (post compression/encryption).
    pub payload_len: u32,
    /// Extended header length, 0 when absent.
    pub ext_header_len: u16,
}

impl BlockHeader {
    /// Total encoded length of the block this header describes.
    pub const fn block_len(&self) -> u64 {
        (HEADER_WITH_CHECKSUM_LEN + TRAILER_LEN) as u64
            + self.ext_header_len as u64
            + self.payload_len as u64
    }

    /// Encodes the header prefix and its CRC32 into a fixed buffer.
    pub fn encode(&self) -> [u8; HEADER_WITH_CHECKSUM_LEN] {
        let mut buf = [0u8; HEADER_WITH_CHECKSUM_LEN];
        buf[0..4].copy_from_slice(&BLOCK_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6] = self.block_type as u8;
        buf[7] = self.flags.encode();
        buf[8] = self.encoding as u8;
        buf[9..17].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[17..25].copy_from_slice(&self.block_id.to_be_bytes());
        buf[25..29].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[29..31].copy_from_slice(&self.ext_header_len.to_be_bytes());
        // bytes 31..37 stay zero (reserved)
        let crc = crc32fast::hash(&buf[..HEADER_LEN]);
        buf[HEADER_LEN..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes and validates a header prefix.
    ///
    /// The CRC32 is verified before any field beyond it is interpreted;
    /// the caller must not touch payload bytes if this fails.
    pub fn decode(buf: &[u8; HEADER_WITH_CHECKSUM_LEN]) -> StoreResult<Self> {
        let stored = u32::from_be_bytes(buf[HEADER_LEN..].try_into().expect("4 bytes"));
        let computed = crc32fast::hash(&buf[..HEADER_LEN]);
        if stored != computed {
            return Err(StoreError::CorruptHeader {
                block_id: i64::from_be_bytes(buf[17..25].try_into().expect("8 bytes")),
                reason: format!("header crc mismatch: stored {stored:#010x}, computed {computed:#010x}"),
            });
        }

        let block_id = i64::from_be_bytes(buf[17..25].try_into().expect("8 bytes"));
        let corrupt = |reason: String| StoreError::CorruptHeader { block_id, reason };

        let magic = u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes"));
        if magic != BLOCK_MAGIC {
            return Err(corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = u16::from_be_bytes(buf[4..6].try_into().expect("2 bytes"));
        if version != FRAMING_VERSION {
            return Err(corrupt(format!("unsupported framing version {version}")));
        }
        let block_type = BlockType::from_u8(buf[6])
            .ok_or_else(|| corrupt(format!("unknown block type {}", buf[6])))?;
        let flags = BlockFlags::decode(buf[7])
            .ok_or_else(|| corrupt(format!("invalid flags byte {:#04x}", buf[7])))?;
        let encoding = Encoding::from_u8(buf[8])
            .ok_or_else(|| corrupt(format!("unknown encoding {}", buf[8])))?;
        let ext_header_len = u16::from_be_bytes(buf[29..31].try_into().expect("2 bytes"));
        if ext_header_len != 0 && (ext_header_len as usize) < EXT_FIXED_LEN {
            return Err(corrupt(format!("extended header too short: {ext_header_len}")));
        }

        Ok(Self {
            version,
            block_type,
            flags,
            encoding,
            timestamp: i64::from_be_bytes(buf[9..17].try_into().expect("8 bytes")),
            block_id,
            payload_len: u32::from_be_bytes(buf[25..29].try_into().expect("4 bytes")),
            ext_header_len,
        })
    }
}

/// Codec material carried between header and payload when compression or
/// encryption is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHeader {
    /// Payload size before compression.
    pub uncompressed_size: u32,
    /// Encryption IV, zero-padded to 16 bytes.
    pub iv: [u8; 16],
    /// AEAD tag or HMAC, empty when not encrypted.
    pub auth_tag: Vec<u8>,
    /// Key generation that encrypted this block.
    pub key_id: u32,
}

impl ExtendedHeader {
    /// Encoded length.
    pub fn encoded_len(&self) -> usize {
        EXT_FIXED_LEN + self.auth_tag.len()
    }

    /// Appends the encoded extended header to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.uncompressed_size.to_be_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.auth_tag);
        out.extend_from_slice(&self.key_id.to_be_bytes());
    }

    /// Decodes an extended header of the length declared by the block
    /// header.
    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        if buf.len() < EXT_FIXED_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "extended header of {} bytes is below the {EXT_FIXED_LEN}-byte minimum",
                buf.len()
            )));
        }
        let tag_len = buf.len() - EXT_FIXED_LEN;
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&buf[4..20]);
        Ok(Self {
            uncompressed_size: u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")),
            iv,
            auth_tag: buf[20..20 + tag_len].to_vec(),
            key_id: u32::from_be_bytes(buf[20 + tag_len..].try_into().expect("4 bytes")),
        })
    }
}

/// A complete block: header, optional extended header, payload.
///
/// The payload here is the on-disk form, whatever the codec pipeline
/// produced. Decoding back to structured content happens a layer up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block role.
    pub block_type: BlockType,
    /// Codec pipeline flags.
    pub flags: BlockFlags,
    /// Payload serialization encoding.
    pub encoding: Encoding,
    /// Creator-supplied Unix-ms timestamp.
    pub timestamp: i64,
    /// Creator-supplied block id.
    pub block_id: i64,
    /// Codec material, present iff compression or encryption is active.
    pub ext: Option<ExtendedHeader>,
    /// On-disk payload bytes.
    pub payload: Vec<u8>,
}

impl Block {
    /// Creates a plain block with no codec features.
    pub fn new(
        block_type: BlockType,
        block_id: i64,
        timestamp: i64,
        encoding: Encoding,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            block_type,
            flags: BlockFlags::default(),
            encoding,
            timestamp,
            block_id,
            ext: None,
            payload,
        }
    }

    /// The header this block encodes to.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: FRAMING_VERSION,
            block_type: self.block_type,
            flags: self.flags,
            encoding: self.encoding,
            timestamp: self.timestamp,
            block_id: self.block_id,
            payload_len: self.payload.len() as u32,
            ext_header_len: self.ext.as_ref().map_or(0, |e| e.encoded_len() as u16),
        }
    }

    /// Total encoded length in bytes.
    pub fn encoded_len(&self) -> u64 {
        self.header().block_len()
    }

    /// Encodes the full block, computing both checksums.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let mut out = Vec::with_capacity(header.block_len() as usize);
        out.extend_from_slice(&header.encode());
        if let Some(ext) = &self.ext {
            ext.encode_into(&mut out);
        }
        out.extend_from_slice(&self.payload);
        let trailer = trailer_checksum(&out);
        out.extend_from_slice(&trailer.to_be_bytes());
        out
    }

    /// Decodes and fully validates an encoded block.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < MIN_BLOCK_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "{} bytes cannot hold a block",
                bytes.len()
            )));
        }
        let header = BlockHeader::decode(
            bytes[..HEADER_WITH_CHECKSUM_LEN].try_into().expect("sized slice"),
        )?;
        let expected = header.block_len();
        if bytes.len() as u64 != expected {
            return Err(StoreError::CorruptHeader {
                block_id: header.block_id,
                reason: format!("expected {expected} bytes, got {}", bytes.len()),
            });
        }

        let body_end = bytes.len() - TRAILER_LEN;
        let stored = u64::from_be_bytes(bytes[body_end..].try_into().expect("8 bytes"));
        if stored != trailer_checksum(&bytes[..body_end]) {
            return Err(StoreError::CorruptPayload(header.block_id));
        }

        let ext_end = HEADER_WITH_CHECKSUM_LEN + header.ext_header_len as usize;
        let ext = if header.ext_header_len > 0 {
            Some(ExtendedHeader::decode(&bytes[HEADER_WITH_CHECKSUM_LEN..ext_end])?)
        } else {
            None
        };

        Ok(Self {
            block_type: header.block_type,
            flags: header.flags,
            encoding: header.encoding,
            timestamp: header.timestamp,
            block_id: header.block_id,
            ext,
            payload: bytes[ext_end..body_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn sample_block() -> Block {
        Block::new(
            BlockType::Metadata,
            54321,
            1_700_000_000_000,
            Encoding::Json,
            b"{\"walHead\":null}".to_vec(),
        )
    }

    #[test]
    fn header_is_exactly_37_bytes_before_checksum() {
        assert_eq!(HEADER_LEN, 37);
        assert_eq!(HEADER_WITH_CHECKSUM_LEN, 41);
        assert_eq!(MIN_BLOCK_LEN, 49);
    }

    #[test]
    fn roundtrip_plain() {
        let block = sample_block();
        let bytes = block.encode();
        assert_eq!(bytes.len() as u64, block.encoded_len());
        assert_eq!(Block::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn roundtrip_with_extended_header() {
        let mut block = sample_block();
        let mut flags = block.flags;
        flags.compression = emdb_types::CompressionAlgorithm::Zstd;
        block.flags = flags;
        block.ext = Some(ExtendedHeader {
            uncompressed_size: 4096,
            iv: [7; 16],
            auth_tag: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
            key_id: 2,
        });
        let bytes = block.encode();
        assert_eq!(Block::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn header_corruption_is_detected() {
        let mut bytes = sample_block().encode();
        bytes[9] ^= 0xff; // timestamp byte, inside the checksummed prefix
        assert!(matches!(
            Block::decode(&bytes),
            Err(StoreError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn payload_corruption_is_detected() {
        let block = sample_block();
        let mut bytes = block.encode();
        let payload_at = HEADER_WITH_CHECKSUM_LEN + 2;
        bytes[payload_at] ^= 0xff;
        assert_eq!(
            Block::decode(&bytes),
            Err(StoreError::CorruptPayload(block.block_id))
        );
    }

    #[test]
    fn empty_payload_roundtrips() {
        let block = Block::new(BlockType::Segment, 1, 0, Encoding::RawBytes, Vec::new());
        let bytes = block.encode();
        assert_eq!(bytes.len(), MIN_BLOCK_LEN);
        assert_eq!(Block::decode(&bytes).unwrap(), block);
    }

    proptest! {
        /// Any payload round-trips byte-identically through the framing.
        #[test]
        fn roundtrip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..4096),
                                 block_id in any::<i64>(),
                                 timestamp in any::<i64>()) {
            let block = Block::new(BlockType::EmailBatch, block_id, timestamp,
                                   Encoding::RawBytes, payload);
            let decoded = Block::decode(&block.encode()).unwrap();
            prop_assert_eq!(decoded, block);
        }

        /// Flipping any single byte of an encoded block makes decoding fail
        /// (or, for reserved bytes, still decode to the same block, never
        /// to a different one).
        #[test]
        fn bit_flips_never_yield_a_different_block(flip in 0usize..64) {
            let block = sample_block();
            let mut bytes = block.encode();
            let at = flip % bytes.len();
            bytes[at] ^= 0x01;
            match Block::decode(&bytes) {
                Ok(decoded) => prop_assert_eq!(decoded, block),
                Err(_) => {}
            }
        }
    }
}
