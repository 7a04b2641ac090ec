//! On-disk block enums and the packed flags byte.
//!
//! The flags byte wires the whole codec pipeline together:
//!
//! ```text
//! bit  7        6          5..3          2..0
//!    +----+------------+-----------+-------------+
//!    | E  | C (mirror) | encryption | compression |
//!    +----+------------+-----------+-------------+
//! ```
//!
//! Bits 0–2 name the compression algorithm, bits 3–5 the encryption
//! algorithm, bit 6 mirrors "payload is compressed" and bit 7 mirrors
//! "payload is encrypted". The mirrors let a scanner classify blocks
//! without consulting the algorithm tables.

use serde::{Deserialize, Serialize};

/// `block_id` 0 is reserved for the header block written at creation.
pub const HEADER_BLOCK_ID: i64 = 0;

/// The role of a block within the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    /// The first block of the file, carrying format version and capabilities.
    Header = 0,
    /// Root-pointer block: index roots, WAL head, folder tree location.
    Metadata = 1,
    /// Append-only operation records (supersession tracking).
    Wal = 2,
    /// The folder hierarchy and folder → block map.
    FolderTree = 3,
    /// One folder's membership list.
    Folder = 4,
    /// Generic data segment.
    Segment = 5,
    /// An immutable sorted key/value index segment.
    ZoneTreeSegmentKv = 6,
    /// Reserved for vector index segments.
    ZoneTreeSegmentVector = 7,
    /// Reclaimable region produced by compaction planning.
    FreeSpace = 8,
    /// Cached envelope listing for one folder, chained to its predecessor.
    FolderEnvelope = 9,
    /// A packed batch of raw EML messages.
    EmailBatch = 10,
    /// Wrapped per-block key material.
    KeyManager = 11,
    /// Reserved for key-exchange material.
    KeyExchange = 12,
    /// A tamper-evidence hash chain entry.
    HashChain = 13,
}

impl BlockType {
    /// Decodes a block type from its wire byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Header,
            1 => Self::Metadata,
            2 => Self::Wal,
            3 => Self::FolderTree,
            4 => Self::Folder,
            5 => Self::Segment,
            6 => Self::ZoneTreeSegmentKv,
            7 => Self::ZoneTreeSegmentVector,
            8 => Self::FreeSpace,
            9 => Self::FolderEnvelope,
            10 => Self::EmailBatch,
            11 => Self::KeyManager,
            12 => Self::KeyExchange,
            13 => Self::HashChain,
            _ => return None,
        })
    }
}

/// Payload compression algorithm, stored in flag bits 0–2.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    /// Payload stored verbatim.
    #[default]
    None = 0,
    /// DEFLATE with a gzip wrapper.
    Gzip = 1,
    /// LZ4 block format with length prefix.
    Lz4 = 2,
    /// Zstandard.
    Zstd = 3,
    /// Brotli.
    Brotli = 4,
}

impl CompressionAlgorithm {
    /// Decodes an algorithm from its 3-bit wire value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Gzip,
            2 => Self::Lz4,
            3 => Self::Zstd,
            4 => Self::Brotli,
            _ => return None,
        })
    }
}

/// Payload encryption algorithm, stored in flag bits 3–5.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncryptionAlgorithm {
    /// Payload stored in the clear.
    #[default]
    None = 0,
    /// AES-256-GCM (AEAD, 12-byte nonce).
    Aes256Gcm = 1,
    /// ChaCha20-Poly1305 (AEAD, 12-byte nonce).
    ChaCha20Poly1305 = 2,
    /// AES-256-CBC with encrypt-then-MAC HMAC-SHA256.
    Aes256CbcHmac = 3,
}

impl EncryptionAlgorithm {
    /// Decodes an algorithm from its 3-bit wire value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Aes256Gcm,
            2 => Self::ChaCha20Poly1305,
            3 => Self::Aes256CbcHmac,
            _ => return None,
        })
    }

    /// Key size in bytes required by the algorithm.
    pub const fn key_len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
            // 32 cipher bytes + 32 MAC bytes.
            Self::Aes256CbcHmac => 64,
        }
    }

    /// IV size in bytes generated per block.
    pub const fn iv_len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 12,
            Self::Aes256CbcHmac => 16,
        }
    }
}

/// Payload serialization encoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Encoding {
    /// Byte passthrough; the payload owns its own framing.
    #[default]
    RawBytes = 0,
    /// Canonical camelCase JSON.
    Json = 1,
    /// Protobuf wire format.
    Protobuf = 2,
    /// Reserved; decoding fails with `UnsupportedEncoding`.
    CapnProto = 3,
}

impl Encoding {
    /// Decodes an encoding from its wire byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::RawBytes,
            1 => Self::Json,
            2 => Self::Protobuf,
            3 => Self::CapnProto,
            _ => return None,
        })
    }
}

/// The packed header flags byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFlags {
    /// Compression algorithm (bits 0–2).
    pub compression: CompressionAlgorithm,
    /// Encryption algorithm (bits 3–5).
    pub encryption: EncryptionAlgorithm,
}

impl BlockFlags {
    const COMPRESSED_MIRROR: u8 = 1 << 6;
    const ENCRYPTED_MIRROR: u8 = 1 << 7;

    /// Constructs flags from the configured pipeline.
    pub const fn new(compression: CompressionAlgorithm, encryption: EncryptionAlgorithm) -> Self {
        Self { compression, encryption }
    }

    /// True when the payload bytes on disk are compressed.
    pub const fn is_compressed(&self) -> bool {
        !matches!(self.compression, CompressionAlgorithm::None)
    }

    /// True when the payload bytes on disk are encrypted.
    pub const fn is_encrypted(&self) -> bool {
        !matches!(self.encryption, EncryptionAlgorithm::None)
    }

    /// Packs the flags into the wire byte, including the mirror bits.
    pub const fn encode(&self) -> u8 {
        let mut byte = self.compression as u8 | (self.encryption as u8) << 3;
        if self.is_compressed() {
            byte |= Self::COMPRESSED_MIRROR;
        }
        if self.is_encrypted() {
            byte |= Self::ENCRYPTED_MIRROR;
        }
        byte
    }

    /// Unpacks the wire byte. Unknown algorithm bits or mirror bits that
    /// disagree with the algorithm fields are rejected.
    pub fn decode(byte: u8) -> Option<Self> {
        let compression = CompressionAlgorithm::from_u8(byte & 0b111)?;
        let encryption = EncryptionAlgorithm::from_u8((byte >> 3) & 0b111)?;
        let flags = Self { compression, encryption };
        let mirrors_ok = (byte & Self::COMPRESSED_MIRROR != 0) == flags.is_compressed()
            && (byte & Self::ENCRYPTED_MIRROR != 0) == flags.is_encrypted();
        mirrors_ok.then_some(flags)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_roundtrip_all_combinations() {
        for c in 0..=4u8 {
            for e in 0..=3u8 {
                let flags = BlockFlags::new(
                    CompressionAlgorithm::from_u8(c).unwrap(),
                    EncryptionAlgorithm::from_u8(e).unwrap(),
                );
                assert_eq!(BlockFlags::decode(flags.encode()), Some(flags));
            }
        }
    }

    #[test]
    fn flags_reject_bad_mirror() {
        // Gzip without the compressed mirror bit set.
        assert_eq!(BlockFlags::decode(0b0000_0001), None);
        // Mirror set but algorithm is None.
        assert_eq!(BlockFlags::decode(0b0100_0000), None);
    }

    #[test]
    fn block_type_wire_values() {
        assert_eq!(BlockType::from_u8(10), Some(BlockType::EmailBatch));
        assert_eq!(BlockType::from_u8(6), Some(BlockType::ZoneTreeSegmentKv));
        assert_eq!(BlockType::from_u8(14), None);
    }

    #[test]
    fn key_lengths() {
        assert_eq!(EncryptionAlgorithm::Aes256Gcm.key_len(), 32);
        assert_eq!(EncryptionAlgorithm::Aes256CbcHmac.key_len(), 64);
        assert_eq!(EncryptionAlgorithm::Aes256CbcHmac.iv_len(), 16);
        assert_eq!(EncryptionAlgorithm::ChaCha20Poly1305.iv_len(), 12);
    }
}
