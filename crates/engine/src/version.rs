//! Format versioning.
//!
//! The first block of every database (`block_id` 0) is a Header block
//! holding the format version, the capability bitset, and per-block-type
//! payload format versions. It is always written plain so any build can
//! read it before deciding whether it may open the rest of the file.

use crate::{EngineError, EngineResult};
use emdb_codec::{decode_block, encode_block, CodecConfig};
use emdb_store::RawBlockStore;
use emdb_types::{
    BlockContent, BlockType, Capability, DatabaseVersion, Encoding, HeaderContent, MigrationPlan,
    MigrationStep, VersionCompatibility, HEADER_BLOCK_ID,
};
use std::sync::Arc;
use tracing::info;

/// Reads, validates, and writes the header block.
#[derive(Debug)]
pub struct VersionManager {
    store: Arc<RawBlockStore>,
    header: HeaderContent,
    compatibility: VersionCompatibility,
}

impl VersionManager {
    /// Writes the creation-time header block for a fresh database.
    pub fn create(store: Arc<RawBlockStore>, now_ms: i64) -> EngineResult<Self> {
        let header = HeaderContent {
            format_version: DatabaseVersion::CURRENT,
            capabilities: Capability::all(),
            block_format_versions: (0u8..=13).map(|t| (t, 1u16)).collect(),
        };
        Self::write_header(&store, &header, now_ms)?;
        info!(
            target: "emdb::version",
            version = %header.format_version,
            "wrote creation header"
        );
        Ok(Self { store, header, compatibility: VersionCompatibility::Identical })
    }

    /// Reads and validates the header of an existing database, applying
    /// the compatibility matrix against this build.
    pub fn open(store: Arc<RawBlockStore>) -> EngineResult<Self> {
        let manager = Self::open_unchecked(store)?;
        match manager.compatibility {
            VersionCompatibility::MigrationRequired => Err(EngineError::MigrationRequired {
                file: manager.header.format_version,
                current: DatabaseVersion::CURRENT,
            }),
            VersionCompatibility::Unsupported => {
                Err(EngineError::UnsupportedVersion(manager.header.format_version))
            }
            _ => Ok(manager),
        }
    }

    /// Reads the header without applying the compatibility gate. Only
    /// the migration path uses this, to finish rewriting a file whose
    /// version would otherwise refuse to open.
    pub fn open_unchecked(store: Arc<RawBlockStore>) -> EngineResult<Self> {
        let block = store.read(HEADER_BLOCK_ID).map_err(|e| match e {
            emdb_store::StoreError::NotFound(_) => {
                EngineError::CorruptHeader("database has no header block".into())
            }
            other => other.into(),
        })?;
        if block.block_type != BlockType::Header {
            return Err(EngineError::CorruptHeader(format!(
                "block 0 has type {:?}, expected Header",
                block.block_type
            )));
        }
        let header = match decode_block(&block, None)? {
            BlockContent::Header(header) => header,
            other => {
                return Err(EngineError::CorruptHeader(format!(
                    "block 0 decodes to {:?} content",
                    other.block_type()
                )))
            }
        };

        let compatibility =
            VersionCompatibility::classify(header.format_version, DatabaseVersion::CURRENT);
        info!(
            target: "emdb::version",
            version = %header.format_version,
            ?compatibility,
            "read database header"
        );
        Ok(Self { store, header, compatibility })
    }

    fn write_header(
        store: &RawBlockStore,
        header: &HeaderContent,
        now_ms: i64,
    ) -> EngineResult<()> {
        let block = encode_block(
            &BlockContent::Header(header.clone()),
            BlockType::Header,
            HEADER_BLOCK_ID,
            now_ms,
            Encoding::Json,
            CodecConfig::PLAIN,
            None,
        )?;
        store.append_durable(&block)?;
        Ok(())
    }

    /// The file's format version.
    pub const fn version(&self) -> DatabaseVersion {
        self.header.format_version
    }

    /// Verdict of the file against this build.
    pub const fn compatibility(&self) -> VersionCompatibility {
        self.compatibility
    }

    /// The header contents.
    pub const fn header(&self) -> &HeaderContent {
        &self.header
    }

    /// Rejects a feature the file does not declare. Call sites gate
    /// optional features on this when the file is older than the build.
    pub fn require_capability(&self, capability: Capability) -> EngineResult<()> {
        if capability.is_set(self.header.capabilities) {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "database does not declare the {capability:?} capability; migrate first"
            )))
        }
    }

    /// Plans a migration from the file's version to `target`. Steps go
    /// major by major; a same-or-lower target yields an empty plan.
    pub fn plan_migration(&self, target: DatabaseVersion) -> MigrationPlan {
        let from = self.header.format_version;
        let file_size = self.store.file_size();
        let steps = (from.major..target.major)
            .map(|major| MigrationStep {
                from_major: major,
                to_major: major + 1,
                // Copy-forward is sequential I/O, roughly 100 MB/s.
                estimated_duration_secs: (file_size / (100u64 << 20)).max(1),
                required_disk_space: file_size,
                sub_steps: vec![
                    "copy live blocks into a sibling file".into(),
                    format!("rewrite block payload formats for major {}", major + 1),
                    "write the upgraded header block".into(),
                    "swap the sibling file into place".into(),
                ],
            })
            .collect();
        MigrationPlan { from, to: target, steps }
    }

    /// Writes the post-migration header and adopts it. The caller has
    /// already copied blocks forward; the old header block becomes
    /// superseded by id.
    pub fn finish_migration(
        &mut self,
        target: DatabaseVersion,
        now_ms: i64,
    ) -> EngineResult<()> {
        let mut header = self.header.clone();
        header.format_version = target;
        header.capabilities = Capability::all();
        Self::write_header(&self.store, &header, now_ms)?;
        self.header = header;
        self.compatibility =
            VersionCompatibility::classify(target, DatabaseVersion::CURRENT);
        info!(target: "emdb::version", version = %target, "migration header written");
        Ok(())
    }
}
