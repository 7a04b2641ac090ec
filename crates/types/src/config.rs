//! Configuration surface of the database. A closed set: everything the
//! engine can be told is here, with defaults matching the documented
//! behavior.

use crate::{CompressionAlgorithm, EncryptionAlgorithm};
use serde::{Deserialize, Serialize};

/// Prior KeyManager generations kept readable after rotation.
pub const DEFAULT_KEY_VERSIONS_TO_KEEP: u32 = 5;

/// Backup files retained by compaction/migration.
pub const DEFAULT_BACKUPS_TO_KEEP: usize = 3;

/// Target size of email batch blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetBlockSize {
    /// Scale the target with total database size (50 MB → 1 GiB ladder).
    #[default]
    Auto,
    /// A fixed byte target.
    Fixed(u64),
}

/// Background maintenance knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceConfig {
    /// Master switch for background maintenance.
    pub enable: bool,
    /// Periodic compaction check interval.
    pub interval_hours: u64,
    /// Compact when superseded bytes exceed this many bytes.
    pub compaction_threshold_bytes: u64,
    /// Compact when `superseded_bytes / file_size` exceeds this ratio.
    pub compaction_threshold_ratio: f64,
    /// Minimum age of a superseded block before it may be dropped,
    /// allowing in-flight readers to drain.
    pub min_age_hours_for_deletion: u64,
    /// Prior KeyManager generations to keep.
    pub key_versions_to_keep: u32,
    /// Backup files to keep.
    pub backups_to_keep: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interval_hours: 24,
            compaction_threshold_bytes: 1 << 30,
            compaction_threshold_ratio: 0.33,
            min_age_hours_for_deletion: 24,
            key_versions_to_keep: DEFAULT_KEY_VERSIONS_TO_KEEP,
            backups_to_keep: DEFAULT_BACKUPS_TO_KEEP,
        }
    }
}

/// Bounds for the decoded-payload and folder caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Aggregate decoded bytes held by the payload cache.
    pub payload_bytes_max: u64,
    /// Maximum payload cache entries.
    pub payload_entries_max: usize,
    /// Maximum cached folder contents.
    pub folder_entries_max: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            payload_bytes_max: 256 << 20,
            payload_entries_max: 1024,
            folder_entries_max: 256,
        }
    }
}

/// Options accepted by `open`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOptions {
    /// Create the database file when it does not exist.
    pub create_if_missing: bool,
    /// Refuse every mutating operation.
    pub read_only: bool,
    /// Master key for encrypted databases; `None` leaves encryption locked.
    #[serde(skip)]
    pub master_key: Option<[u8; 32]>,
    /// Batch sizing policy.
    pub target_block_size: TargetBlockSize,
    /// Compression applied to new blocks unless overridden per call.
    pub compression_default: CompressionAlgorithm,
    /// Encryption applied to new blocks unless overridden per call.
    pub encryption_default: EncryptionAlgorithm,
    /// Maintain the tamper-evidence hash chain.
    pub hash_chain: bool,
    /// Maintenance knobs.
    pub maintenance: MaintenanceConfig,
    /// Cache bounds.
    pub cache: CacheConfig,
    /// Seconds of builder idle time that force a batch flush.
    pub flush_interval_secs: u64,
}

impl DatabaseOptions {
    /// Options for a fresh writable database.
    pub fn create() -> Self {
        Self { create_if_missing: true, flush_interval_secs: 30, ..Self::default() }
    }
}

// The master key must never reach logs or error messages.
impl core::fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("create_if_missing", &self.create_if_missing)
            .field("read_only", &self.read_only)
            .field("master_key", &self.master_key.map(|_| "<redacted>"))
            .field("target_block_size", &self.target_block_size)
            .field("compression_default", &self.compression_default)
            .field("encryption_default", &self.encryption_default)
            .field("hash_chain", &self.hash_chain)
            .field("maintenance", &self.maintenance)
            .field("cache", &self.cache)
            .field("flush_interval_secs", &self.flush_interval_secs)
            .finish()
    }
}
