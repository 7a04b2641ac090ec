//! Structured payloads carried by typed blocks.
//!
//! Every structured block type maps to exactly one variant of
//! [`BlockContent`]; the decoder picks the concrete type from the
//! `(encoding, block_type)` pair in the header, so no self-describing
//! envelope is needed on the wire.

use crate::{BlockType, EmailId, Envelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hex serde adapter for fixed 32-byte hashes, keeping the canonical JSON
/// form readable and stable.
pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a 32-byte array as lowercase hex.
    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    /// Deserializes lowercase hex into a 32-byte array.
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// The payload of a structured block, dispatched by [`BlockType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockContent {
    /// Opaque bytes; the payload owns its own framing (email batches,
    /// index segments).
    Raw(Vec<u8>),
    /// The creation-time header block.
    Header(HeaderContent),
    /// Root pointers.
    Metadata(MetadataContent),
    /// Supersession records appended since the previous WAL block.
    Wal(Vec<SupersededRecord>),
    /// The folder hierarchy.
    FolderTree(FolderTree),
    /// One folder's membership.
    Folder(FolderContent),
    /// One folder's cached envelope listing.
    FolderEnvelope(FolderEnvelopeContent),
    /// Wrapped key material.
    KeyManager(KeyManagerContent),
    /// One hash-chain entry.
    HashChain(HashChainEntry),
}

impl BlockContent {
    /// The block type this content must be stored under.
    pub const fn block_type(&self) -> BlockType {
        match self {
            Self::Raw(_) => BlockType::Segment,
            Self::Header(_) => BlockType::Header,
            Self::Metadata(_) => BlockType::Metadata,
            Self::Wal(_) => BlockType::Wal,
            Self::FolderTree(_) => BlockType::FolderTree,
            Self::Folder(_) => BlockType::Folder,
            Self::FolderEnvelope(_) => BlockType::FolderEnvelope,
            Self::KeyManager(_) => BlockType::KeyManager,
            Self::HashChain(_) => BlockType::HashChain,
        }
    }
}

/// Contents of the header block (`block_id` 0).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderContent {
    /// On-disk format version.
    pub format_version: crate::DatabaseVersion,
    /// Capability bitset; see [`Capability`](crate::Capability).
    pub capabilities: u64,
    /// Per-block-type payload format versions, keyed by the wire byte.
    pub block_format_versions: BTreeMap<u8, u16>,
}

/// Root pointers; the newest Metadata block is authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataContent {
    /// Newest WAL block, or `None` before the first supersession.
    pub wal_head: Option<i64>,
    /// Live segment block ids per index, youngest last.
    pub index_roots: BTreeMap<String, Vec<i64>>,
    /// Current folder tree block.
    pub folder_tree: Option<i64>,
    /// Hash chain head: `(sequence, entry_hash)`.
    pub hash_chain_head: Option<HashChainHead>,
    /// Current KeyManager block ids, oldest generation first.
    pub key_manager_blocks: Vec<i64>,
}

/// Head of the hash chain as recorded in Metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashChainHead {
    /// Sequence number of the newest entry.
    pub sequence: u64,
    /// SHA-256 of the newest entry.
    #[serde(with = "hex_array")]
    pub entry_hash: [u8; 32],
}

/// One folder's membership list. A new version is appended on every
/// mutation; the prior version is superseded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderContent {
    /// Stable folder id, assigned at creation.
    pub folder_id: i64,
    /// Leaf name.
    pub name: String,
    /// Parent folder id; `None` for children of the root.
    pub parent_folder_id: Option<i64>,
    /// Member emails in insertion order.
    pub email_ids: Vec<EmailId>,
    /// Strictly increasing per-folder version.
    pub version: u64,
}

/// One folder's cached envelope listing, chained to its predecessor so
/// history survives until compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEnvelopeContent {
    /// Full path of the folder, `/`-separated.
    pub folder_path: String,
    /// Mirrors the folder's version at write time.
    pub version: u64,
    /// Unix-ms timestamp of the mutation that produced this listing.
    pub last_modified: i64,
    /// Envelopes of all current members.
    pub envelopes: Vec<Envelope>,
    /// The superseded predecessor envelope block, if any.
    pub previous_block_id: Option<i64>,
}

/// The folder hierarchy, rewritten on any folder set change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderTree {
    /// Root folder id.
    pub root_folder_id: i64,
    /// Folder path → folder id.
    pub folders: BTreeMap<String, i64>,
    /// Folder id → current Folder block id.
    pub folder_blocks: BTreeMap<i64, i64>,
    /// Folder id → current FolderEnvelope block id.
    pub envelope_blocks: BTreeMap<i64, i64>,
    /// Monotone source for new folder ids.
    pub next_folder_id: i64,
}

/// A superseded-block record as persisted in WAL blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupersededRecord {
    /// The block that was replaced.
    pub block_id: i64,
    /// Its type at the time of supersession.
    pub block_type: BlockType,
    /// Unix-ms timestamp of the supersession.
    pub superseded_at: i64,
    /// Human-readable reason (`"folder update"`, `"segment merge"`, ...).
    pub reason: String,
}

/// A single wrapped data key held by the key manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    /// The block this key belongs to.
    pub block_id: i64,
    /// Key generation the derivation used.
    pub key_id: u32,
    /// AES-GCM-wrapped key material: nonce ‖ ciphertext ‖ tag.
    pub wrapped: Vec<u8>,
}

/// Contents of a KeyManager block. Superseded on rotation; a bounded
/// number of prior generations stays readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyManagerContent {
    /// Generation counter, incremented on rotation.
    pub generation: u32,
    /// Wrapped per-block keys.
    pub keys: Vec<WrappedKey>,
}

/// One entry of the tamper-evidence hash chain. Append-only, never
/// superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashChainEntry {
    /// The block being chained.
    pub block_id: i64,
    /// SHA-256 of the full encoded block bytes.
    #[serde(with = "hex_array")]
    pub block_hash: [u8; 32],
    /// SHA-256 of the previous entry, all-zero for the first.
    #[serde(with = "hex_array")]
    pub previous_entry_hash: [u8; 32],
    /// Monotone sequence number, starting at 1.
    pub sequence: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_is_camel_case() {
        let content = BlockContent::Folder(FolderContent {
            folder_id: 3,
            name: "Inbox".into(),
            parent_folder_id: None,
            email_ids: vec![EmailId::new(10, 0)],
            version: 1,
        });
        let json = serde_json::to_string(&content).unwrap();
        assert!(json.contains("folderId"), "{json}");
        assert!(json.contains("parentFolderId"), "{json}");
        let back: BlockContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn hash_fields_serialize_as_hex() {
        let entry = HashChainEntry {
            block_id: 9,
            block_hash: [0xab; 32],
            previous_entry_hash: [0; 32],
            sequence: 1,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(&"ab".repeat(32)), "{json}");
        let back: HashChainEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
