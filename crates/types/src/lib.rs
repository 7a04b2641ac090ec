//! Shared value types for the `emdb` storage engine.
//!
//! This crate is a leaf: every other member of the workspace depends on it,
//! and it depends on nothing but serialization support. It defines the
//! on-disk enums ([`BlockType`], [`CompressionAlgorithm`],
//! [`EncryptionAlgorithm`], [`Encoding`]), the compound [`EmailId`], the
//! cached [`Envelope`] tuple, the [`BlockContent`] tagged union carried by
//! structured blocks, and the configuration surface of the database.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod block;
pub use block::{
    BlockFlags, BlockType, CompressionAlgorithm, Encoding, EncryptionAlgorithm, HEADER_BLOCK_ID,
};

pub mod id;
pub use id::{EmailId, ParseEmailIdError};

pub mod envelope;
pub use envelope::Envelope;

pub mod content;
pub use content::{
    BlockContent, FolderContent, FolderEnvelopeContent, FolderTree, HashChainEntry, HeaderContent,
    KeyManagerContent, MetadataContent, SupersededRecord, WrappedKey,
};

pub mod config;
pub use config::{
    CacheConfig, DatabaseOptions, MaintenanceConfig, TargetBlockSize, DEFAULT_BACKUPS_TO_KEEP,
    DEFAULT_KEY_VERSIONS_TO_KEEP,
};

pub mod version;
pub use version::{
    Capability, DatabaseVersion, MigrationPlan, MigrationStep, VersionCompatibility,
};

pub mod wire;
