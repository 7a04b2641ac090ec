//! Protobuf wire mirrors of the structured block contents.
//!
//! Tags are frozen: changing one is an on-disk format break and must bump
//! the per-block-type format version in the header block. Conversions to
//! the domain types are fallible only where fixed-size hashes are decoded.

// Field-level docs would only restate the mirrored domain types.
#![allow(missing_docs)]

use crate::{
    content::HashChainHead, BlockType, EmailId, Envelope, FolderContent, FolderEnvelopeContent,
    FolderTree, HashChainEntry, HeaderContent, KeyManagerContent, MetadataContent,
    SupersededRecord, WrappedKey,
};
use prost::Message;
use std::collections::BTreeMap;
use thiserror::Error;

/// A wire value failed to convert into its domain type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A hash field was not exactly 32 bytes.
    #[error("hash field holds {0} bytes, expected 32")]
    BadHashLength(usize),
    /// An enum field held an out-of-range discriminant.
    #[error("invalid discriminant {0} for {1}")]
    BadDiscriminant(u32, &'static str),
}

fn hash32(bytes: Vec<u8>) -> Result<[u8; 32], WireError> {
    let len = bytes.len();
    bytes.try_into().map_err(|_| WireError::BadHashLength(len))
}

/// Mirror of [`HeaderContent`].
#[derive(Clone, PartialEq, Message)]
pub struct HeaderWire {
    /// `major.minor.patch` packed as three uint32 fields.
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
    #[prost(uint32, tag = "3")]
    pub patch: u32,
    #[prost(uint64, tag = "4")]
    pub capabilities: u64,
    #[prost(btree_map = "uint32, uint32", tag = "5")]
    pub block_format_versions: BTreeMap<u32, u32>,
}

impl From<&HeaderContent> for HeaderWire {
    fn from(h: &HeaderContent) -> Self {
        Self {
            major: h.format_version.major.into(),
            minor: h.format_version.minor.into(),
            patch: h.format_version.patch.into(),
            capabilities: h.capabilities,
            block_format_versions: h
                .block_format_versions
                .iter()
                .map(|(k, v)| (u32::from(*k), u32::from(*v)))
                .collect(),
        }
    }
}

impl TryFrom<HeaderWire> for HeaderContent {
    type Error = WireError;

    fn try_from(w: HeaderWire) -> Result<Self, WireError> {
        Ok(Self {
            format_version: crate::DatabaseVersion::new(
                w.major as u16,
                w.minor as u16,
                w.patch as u16,
            ),
            capabilities: w.capabilities,
            block_format_versions: w
                .block_format_versions
                .into_iter()
                .map(|(k, v)| (k as u8, v as u16))
                .collect(),
        })
    }
}

/// Mirror of [`HashChainHead`].
#[derive(Clone, PartialEq, Message)]
pub struct HashChainHeadWire {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub entry_hash: Vec<u8>,
}

/// Mirror of [`MetadataContent`].
#[derive(Clone, PartialEq, Message)]
pub struct MetadataWire {
    #[prost(int64, optional, tag = "1")]
    pub wal_head: Option<i64>,
    #[prost(btree_map = "string, message", tag = "2")]
    pub index_roots: BTreeMap<String, BlockIdList>,
    #[prost(int64, optional, tag = "3")]
    pub folder_tree: Option<i64>,
    #[prost(message, optional, tag = "4")]
    pub hash_chain_head: Option<HashChainHeadWire>,
    #[prost(int64, repeated, tag = "5")]
    pub key_manager_blocks: Vec<i64>,
}

/// Repeated block-id value for map fields.
#[derive(Clone, PartialEq, Message)]
pub struct BlockIdList {
    #[prost(int64, repeated, tag = "1")]
    pub ids: Vec<i64>,
}

impl From<&MetadataContent> for MetadataWire {
    fn from(m: &MetadataContent) -> Self {
        Self {
            wal_head: m.wal_head,
            index_roots: m
                .index_roots
                .iter()
                .map(|(k, v)| (k.clone(), BlockIdList { ids: v.clone() }))
                .collect(),
            folder_tree: m.folder_tree,
            hash_chain_head: m.hash_chain_head.as_ref().map(|h| HashChainHeadWire {
                sequence: h.sequence,
                entry_hash: h.entry_hash.to_vec(),
            }),
            key_manager_blocks: m.key_manager_blocks.clone(),
        }
    }
}

impl TryFrom<MetadataWire> for MetadataContent {
    type Error = WireError;

    fn try_from(w: MetadataWire) -> Result<Self, WireError> {
        Ok(Self {
            wal_head: w.wal_head,
            index_roots: w.index_roots.into_iter().map(|(k, v)| (k, v.ids)).collect(),
            folder_tree: w.folder_tree,
            hash_chain_head: match w.hash_chain_head {
                Some(h) => Some(HashChainHead {
                    sequence: h.sequence,
                    entry_hash: hash32(h.entry_hash)?,
                }),
                None => None,
            },
            key_manager_blocks: w.key_manager_blocks,
        })
    }
}

/// Mirror of [`FolderTree`].
#[derive(Clone, PartialEq, Message)]
pub struct FolderTreeWire {
    #[prost(int64, tag = "1")]
    pub root_folder_id: i64,
    #[prost(btree_map = "string, int64", tag = "2")]
    pub folders: BTreeMap<String, i64>,
    #[prost(btree_map = "int64, int64", tag = "3")]
    pub folder_blocks: BTreeMap<i64, i64>,
    #[prost(btree_map = "int64, int64", tag = "4")]
    pub envelope_blocks: BTreeMap<i64, i64>,
    #[prost(int64, tag = "5")]
    pub next_folder_id: i64,
}

impl From<&FolderTree> for FolderTreeWire {
    fn from(t: &FolderTree) -> Self {
        Self {
            root_folder_id: t.root_folder_id,
            folders: t.folders.clone(),
            folder_blocks: t.folder_blocks.clone(),
            envelope_blocks: t.envelope_blocks.clone(),
            next_folder_id: t.next_folder_id,
        }
    }
}

impl From<FolderTreeWire> for FolderTree {
    fn from(w: FolderTreeWire) -> Self {
        Self {
            root_folder_id: w.root_folder_id,
            folders: w.folders,
            folder_blocks: w.folder_blocks,
            envelope_blocks: w.envelope_blocks,
            next_folder_id: w.next_folder_id,
        }
    }
}

/// Mirror of [`EmailId`].
#[derive(Clone, PartialEq, Message)]
pub struct EmailIdWire {
    #[prost(int64, tag = "1")]
    pub batch_id: i64,
    #[prost(int32, tag = "2")]
    pub local_id: i32,
}

impl From<EmailId> for EmailIdWire {
    fn from(id: EmailId) -> Self {
        Self { batch_id: id.batch_id, local_id: id.local_id }
    }
}

impl From<EmailIdWire> for EmailId {
    fn from(w: EmailIdWire) -> Self {
        Self { batch_id: w.batch_id, local_id: w.local_id }
    }
}

/// Mirror of [`FolderContent`].
#[derive(Clone, PartialEq, Message)]
pub struct FolderWire {
    #[prost(int64, tag = "1")]
    pub folder_id: i64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int64, optional, tag = "3")]
    pub parent_folder_id: Option<i64>,
    #[prost(message, repeated, tag = "4")]
    pub email_ids: Vec<EmailIdWire>,
    #[prost(uint64, tag = "5")]
    pub version: u64,
}

impl From<&FolderContent> for FolderWire {
    fn from(f: &FolderContent) -> Self {
        Self {
            folder_id: f.folder_id,
            name: f.name.clone(),
            parent_folder_id: f.parent_folder_id,
            email_ids: f.email_ids.iter().copied().map(Into::into).collect(),
            version: f.version,
        }
    }
}

impl From<FolderWire> for FolderContent {
    fn from(w: FolderWire) -> Self {
        Self {
            folder_id: w.folder_id,
            name: w.name,
            parent_folder_id: w.parent_folder_id,
            email_ids: w.email_ids.into_iter().map(Into::into).collect(),
            version: w.version,
        }
    }
}

/// Mirror of [`Envelope`].
#[derive(Clone, PartialEq, Message)]
pub struct EnvelopeWire {
    #[prost(message, optional, tag = "1")]
    pub email_id: Option<EmailIdWire>,
    #[prost(string, tag = "2")]
    pub message_id: String,
    #[prost(string, tag = "3")]
    pub subject: String,
    #[prost(string, tag = "4")]
    pub from: String,
    #[prost(string, tag = "5")]
    pub to: String,
    #[prost(int64, tag = "6")]
    pub date: i64,
    #[prost(uint64, tag = "7")]
    pub size: u64,
    #[prost(bool, tag = "8")]
    pub has_attachments: bool,
    #[prost(string, repeated, tag = "9")]
    pub flags: Vec<String>,
    #[prost(bytes = "vec", tag = "10")]
    pub envelope_hash: Vec<u8>,
}

impl From<&Envelope> for EnvelopeWire {
    fn from(e: &Envelope) -> Self {
        Self {
            email_id: Some(e.email_id.into()),
            message_id: e.message_id.clone(),
            subject: e.subject.clone(),
            from: e.from.clone(),
            to: e.to.clone(),
            date: e.date,
            size: e.size,
            has_attachments: e.has_attachments,
            flags: e.flags.clone(),
            envelope_hash: e.envelope_hash.to_vec(),
        }
    }
}

impl TryFrom<EnvelopeWire> for Envelope {
    type Error = WireError;

    fn try_from(w: EnvelopeWire) -> Result<Self, WireError> {
        Ok(Self {
            email_id: w.email_id.map(Into::into).unwrap_or_default(),
            message_id: w.message_id,
            subject: w.subject,
            from: w.from,
            to: w.to,
            date: w.date,
            size: w.size,
            has_attachments: w.has_attachments,
            flags: w.flags,
            envelope_hash: hash32(w.envelope_hash)?,
        })
    }
}

/// Mirror of [`FolderEnvelopeContent`].
#[derive(Clone, PartialEq, Message)]
pub struct FolderEnvelopeWire {
    #[prost(string, tag = "1")]
    pub folder_path: String,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(int64, tag = "3")]
    pub last_modified: i64,
    #[prost(message, repeated, tag = "4")]
    pub envelopes: Vec<EnvelopeWire>,
    #[prost(int64, optional, tag = "5")]
    pub previous_block_id: Option<i64>,
}

impl From<&FolderEnvelopeContent> for FolderEnvelopeWire {
    fn from(f: &FolderEnvelopeContent) -> Self {
        Self {
            folder_path: f.folder_path.clone(),
            version: f.version,
            last_modified: f.last_modified,
            envelopes: f.envelopes.iter().map(Into::into).collect(),
            previous_block_id: f.previous_block_id,
        }
    }
}

impl TryFrom<FolderEnvelopeWire> for FolderEnvelopeContent {
    type Error = WireError;

    fn try_from(w: FolderEnvelopeWire) -> Result<Self, WireError> {
        Ok(Self {
            folder_path: w.folder_path,
            version: w.version,
            last_modified: w.last_modified,
            envelopes: w
                .envelopes
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            previous_block_id: w.previous_block_id,
        })
    }
}

/// Mirror of one [`SupersededRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct SupersededRecordWire {
    #[prost(int64, tag = "1")]
    pub block_id: i64,
    #[prost(uint32, tag = "2")]
    pub block_type: u32,
    #[prost(int64, tag = "3")]
    pub superseded_at: i64,
    #[prost(string, tag = "4")]
    pub reason: String,
}

/// Mirror of a WAL block: the records appended by one supersession.
#[derive(Clone, PartialEq, Message)]
pub struct WalWire {
    #[prost(message, repeated, tag = "1")]
    pub records: Vec<SupersededRecordWire>,
}

impl From<&[SupersededRecord]> for WalWire {
    fn from(records: &[SupersededRecord]) -> Self {
        Self {
            records: records
                .iter()
                .map(|r| SupersededRecordWire {
                    block_id: r.block_id,
                    block_type: r.block_type as u32,
                    superseded_at: r.superseded_at,
                    reason: r.reason.clone(),
                })
                .collect(),
        }
    }
}

impl TryFrom<WalWire> for Vec<SupersededRecord> {
    type Error = WireError;

    fn try_from(w: WalWire) -> Result<Self, WireError> {
        w.records
            .into_iter()
            .map(|r| {
                let block_type = BlockType::from_u8(r.block_type as u8)
                    .ok_or(WireError::BadDiscriminant(r.block_type, "BlockType"))?;
                Ok(SupersededRecord {
                    block_id: r.block_id,
                    block_type,
                    superseded_at: r.superseded_at,
                    reason: r.reason,
                })
            })
            .collect()
    }
}

/// Mirror of one [`WrappedKey`].
#[derive(Clone, PartialEq, Message)]
pub struct WrappedKeyWire {
    #[prost(int64, tag = "1")]
    pub block_id: i64,
    #[prost(uint32, tag = "2")]
    pub key_id: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub wrapped: Vec<u8>,
}

/// Mirror of [`KeyManagerContent`].
#[derive(Clone, PartialEq, Message)]
pub struct KeyManagerWire {
    #[prost(uint32, tag = "1")]
    pub generation: u32,
    #[prost(message, repeated, tag = "2")]
    pub keys: Vec<WrappedKeyWire>,
}

impl From<&KeyManagerContent> for KeyManagerWire {
    fn from(k: &KeyManagerContent) -> Self {
        Self {
            generation: k.generation,
            keys: k
                .keys
                .iter()
                .map(|key| WrappedKeyWire {
                    block_id: key.block_id,
                    key_id: key.key_id,
                    wrapped: key.wrapped.clone(),
                })
                .collect(),
        }
    }
}

impl From<KeyManagerWire> for KeyManagerContent {
    fn from(w: KeyManagerWire) -> Self {
        Self {
            generation: w.generation,
            keys: w
                .keys
                .into_iter()
                .map(|key| WrappedKey {
                    block_id: key.block_id,
                    key_id: key.key_id,
                    wrapped: key.wrapped,
                })
                .collect(),
        }
    }
}

/// Mirror of [`HashChainEntry`].
#[derive(Clone, PartialEq, Message)]
pub struct HashChainEntryWire {
    #[prost(int64, tag = "1")]
    pub block_id: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub block_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub previous_entry_hash: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub sequence: u64,
}

impl From<&HashChainEntry> for HashChainEntryWire {
    fn from(e: &HashChainEntry) -> Self {
        Self {
            block_id: e.block_id,
            block_hash: e.block_hash.to_vec(),
            previous_entry_hash: e.previous_entry_hash.to_vec(),
            sequence: e.sequence,
        }
    }
}

impl TryFrom<HashChainEntryWire> for HashChainEntry {
    type Error = WireError;

    fn try_from(w: HashChainEntryWire) -> Result<Self, WireError> {
        Ok(Self {
            block_id: w.block_id,
            block_hash: hash32(w.block_hash)?,
            previous_entry_hash: hash32(w.previous_entry_hash)?,
            sequence: w.sequence,
        })
    }
}
