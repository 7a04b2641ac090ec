//! On-disk format versioning and the compatibility matrix.

use serde::{Deserialize, Serialize};

/// Semantic version of the on-disk format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseVersion {
    /// Incompatible format changes.
    pub major: u16,
    /// Backward-compatible additions.
    pub minor: u16,
    /// Fixes with no format impact.
    pub patch: u16,
}

impl DatabaseVersion {
    /// The version written by this build.
    pub const CURRENT: Self = Self { major: 1, minor: 0, patch: 0 };

    /// Creates a version triple.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }
}

impl core::fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Optional features a database file declares in its header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Capability {
    /// Payload compression.
    Compression = 1 << 0,
    /// Payload encryption.
    Encryption = 1 << 1,
    /// Tamper-evidence hash chain.
    HashChain = 1 << 2,
    /// Ordered key/value index segments.
    Indexes = 1 << 3,
    /// Folder envelope listing blocks.
    FolderEnvelopes = 1 << 4,
}

impl Capability {
    /// The capability set written by this build.
    pub const fn all() -> u64 {
        Self::Compression as u64
            | Self::Encryption as u64
            | Self::HashChain as u64
            | Self::Indexes as u64
            | Self::FolderEnvelopes as u64
    }

    /// Tests membership in a bitset.
    pub const fn is_set(self, bits: u64) -> bool {
        bits & self as u64 != 0
    }
}

/// Verdict of comparing a file's version against this build's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionCompatibility {
    /// Same version.
    Identical,
    /// File from an older minor of the same major: open in place; features
    /// beyond the file's declared capabilities are rejected at call sites.
    OlderMinor,
    /// File from a newer minor of the same major: open normally, ignoring
    /// additions this build does not know.
    NewerMinor,
    /// File is exactly one major behind this build: migration required.
    MigrationRequired,
    /// Two or more majors apart, or the file is from a newer major.
    Unsupported,
}

impl VersionCompatibility {
    /// Classifies `file` (the on-disk version) against `current` (this
    /// build).
    pub fn classify(file: DatabaseVersion, current: DatabaseVersion) -> Self {
        if file == current {
            Self::Identical
        } else if file.major == current.major {
            if (file.minor, file.patch) < (current.minor, current.patch) {
                Self::OlderMinor
            } else {
                Self::NewerMinor
            }
        } else if file.major + 1 == current.major {
            Self::MigrationRequired
        } else {
            Self::Unsupported
        }
    }

    /// True when the file can be opened without migration.
    pub const fn openable(&self) -> bool {
        matches!(self, Self::Identical | Self::OlderMinor | Self::NewerMinor)
    }
}

/// One ordered unit of work inside a [`MigrationPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    /// Source major version.
    pub from_major: u16,
    /// Destination major version.
    pub to_major: u16,
    /// Rough wall-clock estimate in seconds.
    pub estimated_duration_secs: u64,
    /// Extra disk required while the sibling file exists.
    pub required_disk_space: u64,
    /// Ordered human-readable sub-steps.
    pub sub_steps: Vec<String>,
}

/// A sequence of adjacent-major migration steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    /// Version being migrated from.
    pub from: DatabaseVersion,
    /// Version being migrated to.
    pub to: DatabaseVersion,
    /// Steps in execution order.
    pub steps: Vec<MigrationStep>,
}

#[cfg(test)]
mod test {
    use super::*;

    const fn v(major: u16, minor: u16, patch: u16) -> DatabaseVersion {
        DatabaseVersion::new(major, minor, patch)
    }

    #[test]
    fn compatibility_matrix() {
        let current = v(2, 1, 0);
        assert_eq!(
            VersionCompatibility::classify(v(2, 1, 0), current),
            VersionCompatibility::Identical
        );
        assert_eq!(
            VersionCompatibility::classify(v(2, 0, 3), current),
            VersionCompatibility::OlderMinor
        );
        assert_eq!(
            VersionCompatibility::classify(v(2, 2, 0), current),
            VersionCompatibility::NewerMinor
        );
        assert_eq!(
            VersionCompatibility::classify(v(1, 9, 9), current),
            VersionCompatibility::MigrationRequired
        );
        assert_eq!(
            VersionCompatibility::classify(v(4, 0, 0), current),
            VersionCompatibility::Unsupported
        );
        assert_eq!(
            VersionCompatibility::classify(v(3, 0, 0), current),
            VersionCompatibility::Unsupported
        );
    }
}
