//! Payload serialization.
//!
//! The wire never carries a self-describing envelope: the decoder picks
//! the concrete content type from the `(block_type, encoding)` pair in
//! the block header. RawBytes passes bytes through untouched, Json is
//! canonical camelCase, Protobuf goes through the `emdb_types::wire`
//! mirrors, and CapnProto is reserved.

use crate::{CodecError, CodecResult};
use emdb_types::{
    wire, BlockContent, BlockType, Encoding, FolderContent, FolderEnvelopeContent, FolderTree,
    HashChainEntry, HeaderContent, KeyManagerContent, MetadataContent, SupersededRecord,
};
use prost::Message;
use serde::{de::DeserializeOwned, Serialize};

fn json_encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CodecError::SerializationFailed(e.to_string()))
}

fn json_decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
}

fn proto_decode<M: Message + Default>(bytes: &[u8]) -> CodecResult<M> {
    M::decode(bytes).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
}

/// Serializes content into payload bytes.
pub fn encode_content(content: &BlockContent, encoding: Encoding) -> CodecResult<Vec<u8>> {
    match encoding {
        Encoding::CapnProto => Err(CodecError::UnsupportedEncoding(encoding)),
        Encoding::RawBytes => match content {
            BlockContent::Raw(bytes) => Ok(bytes.clone()),
            other => Err(CodecError::EncodingMismatch(format!(
                "RawBytes requires a byte payload, got {:?} content",
                other.block_type()
            ))),
        },
        Encoding::Json => match content {
            BlockContent::Raw(_) => Err(CodecError::EncodingMismatch(
                "byte payloads must use the RawBytes encoding".into(),
            )),
            BlockContent::Header(v) => json_encode(v),
            BlockContent::Metadata(v) => json_encode(v),
            BlockContent::Wal(v) => json_encode(v),
            BlockContent::FolderTree(v) => json_encode(v),
            BlockContent::Folder(v) => json_encode(v),
            BlockContent::FolderEnvelope(v) => json_encode(v),
            BlockContent::KeyManager(v) => json_encode(v),
            BlockContent::HashChain(v) => json_encode(v),
        },
        Encoding::Protobuf => match content {
            BlockContent::Raw(_) => Err(CodecError::EncodingMismatch(
                "byte payloads must use the RawBytes encoding".into(),
            )),
            BlockContent::Header(v) => Ok(wire::HeaderWire::from(v).encode_to_vec()),
            BlockContent::Metadata(v) => Ok(wire::MetadataWire::from(v).encode_to_vec()),
            BlockContent::Wal(v) => Ok(wire::WalWire::from(v.as_slice()).encode_to_vec()),
            BlockContent::FolderTree(v) => Ok(wire::FolderTreeWire::from(v).encode_to_vec()),
            BlockContent::Folder(v) => Ok(wire::FolderWire::from(v).encode_to_vec()),
            BlockContent::FolderEnvelope(v) => {
                Ok(wire::FolderEnvelopeWire::from(v).encode_to_vec())
            }
            BlockContent::KeyManager(v) => Ok(wire::KeyManagerWire::from(v).encode_to_vec()),
            BlockContent::HashChain(v) => Ok(wire::HashChainEntryWire::from(v).encode_to_vec()),
        },
    }
}

/// Deserializes payload bytes back into content, dispatching on the
/// `(block_type, encoding)` pair from the header.
pub fn decode_content(
    block_type: BlockType,
    encoding: Encoding,
    bytes: &[u8],
) -> CodecResult<BlockContent> {
    let wire_err = |e: wire::WireError| CodecError::DeserializationFailed(e.to_string());

    match encoding {
        Encoding::CapnProto => Err(CodecError::UnsupportedEncoding(encoding)),
        Encoding::RawBytes => match block_type {
            BlockType::Header
            | BlockType::Metadata
            | BlockType::Wal
            | BlockType::FolderTree
            | BlockType::Folder
            | BlockType::FolderEnvelope
            | BlockType::KeyManager
            | BlockType::HashChain => Err(CodecError::EncodingMismatch(format!(
                "{block_type:?} blocks carry structured content, not raw bytes"
            ))),
            _ => Ok(BlockContent::Raw(bytes.to_vec())),
        },
        Encoding::Json => Ok(match block_type {
            BlockType::Header => BlockContent::Header(json_decode::<HeaderContent>(bytes)?),
            BlockType::Metadata => BlockContent::Metadata(json_decode::<MetadataContent>(bytes)?),
            BlockType::Wal => BlockContent::Wal(json_decode::<Vec<SupersededRecord>>(bytes)?),
            BlockType::FolderTree => BlockContent::FolderTree(json_decode::<FolderTree>(bytes)?),
            BlockType::Folder => BlockContent::Folder(json_decode::<FolderContent>(bytes)?),
            BlockType::FolderEnvelope => {
                BlockContent::FolderEnvelope(json_decode::<FolderEnvelopeContent>(bytes)?)
            }
            BlockType::KeyManager => {
                BlockContent::KeyManager(json_decode::<KeyManagerContent>(bytes)?)
            }
            BlockType::HashChain => BlockContent::HashChain(json_decode::<HashChainEntry>(bytes)?),
            other => {
                return Err(CodecError::EncodingMismatch(format!(
                    "{other:?} blocks carry raw bytes, not structured content"
                )))
            }
        }),
        Encoding::Protobuf => Ok(match block_type {
            BlockType::Header => BlockContent::Header(
                proto_decode::<wire::HeaderWire>(bytes)?.try_into().map_err(wire_err)?,
            ),
            BlockType::Metadata => BlockContent::Metadata(
                proto_decode::<wire::MetadataWire>(bytes)?.try_into().map_err(wire_err)?,
            ),
            BlockType::Wal => BlockContent::Wal(
                proto_decode::<wire::WalWire>(bytes)?.try_into().map_err(wire_err)?,
            ),
            BlockType::FolderTree => {
                BlockContent::FolderTree(proto_decode::<wire::FolderTreeWire>(bytes)?.into())
            }
            BlockType::Folder => {
                BlockContent::Folder(proto_decode::<wire::FolderWire>(bytes)?.into())
            }
            BlockType::FolderEnvelope => BlockContent::FolderEnvelope(
                proto_decode::<wire::FolderEnvelopeWire>(bytes)?.try_into().map_err(wire_err)?,
            ),
            BlockType::KeyManager => {
                BlockContent::KeyManager(proto_decode::<wire::KeyManagerWire>(bytes)?.into())
            }
            BlockType::HashChain => BlockContent::HashChain(
                proto_decode::<wire::HashChainEntryWire>(bytes)?.try_into().map_err(wire_err)?,
            ),
            other => {
                return Err(CodecError::EncodingMismatch(format!(
                    "{other:?} blocks carry raw bytes, not structured content"
                )))
            }
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use emdb_types::EmailId;

    fn folder() -> BlockContent {
        BlockContent::Folder(FolderContent {
            folder_id: 2,
            name: "Archive".into(),
            parent_folder_id: None,
            email_ids: vec![EmailId::new(50, 0)],
            version: 4,
        })
    }

    #[test]
    fn json_roundtrip() {
        let content = folder();
        let bytes = encode_content(&content, Encoding::Json).unwrap();
        assert_eq!(decode_content(BlockType::Folder, Encoding::Json, &bytes).unwrap(), content);
    }

    #[test]
    fn protobuf_roundtrip() {
        let content = folder();
        let bytes = encode_content(&content, Encoding::Protobuf).unwrap();
        assert_eq!(
            decode_content(BlockType::Folder, Encoding::Protobuf, &bytes).unwrap(),
            content
        );
    }

    #[test]
    fn raw_bytes_passthrough() {
        let content = BlockContent::Raw(vec![1, 2, 3]);
        let bytes = encode_content(&content, Encoding::RawBytes).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(
            decode_content(BlockType::EmailBatch, Encoding::RawBytes, &bytes).unwrap(),
            content
        );
    }

    #[test]
    fn raw_encoding_rejects_structured_content() {
        assert!(matches!(
            encode_content(&folder(), Encoding::RawBytes),
            Err(CodecError::EncodingMismatch(_))
        ));
    }

    #[test]
    fn structured_encoding_rejects_raw_content() {
        assert!(matches!(
            encode_content(&BlockContent::Raw(vec![0]), Encoding::Json),
            Err(CodecError::EncodingMismatch(_))
        ));
    }

    #[test]
    fn capnproto_is_reserved() {
        assert_eq!(
            encode_content(&folder(), Encoding::CapnProto),
            Err(CodecError::UnsupportedEncoding(Encoding::CapnProto))
        );
        assert_eq!(
            decode_content(BlockType::Folder, Encoding::CapnProto, &[]),
            Err(CodecError::UnsupportedEncoding(Encoding::CapnProto))
        );
    }
}
