//! Background maintenance: orphan identification, compaction, backups.
//!
//! Compaction copies live blocks into a sibling file in original order,
//! fsyncs it, snapshots the old file as a rotated backup, and atomically
//! renames the sibling into place. A crash anywhere before the rename
//! leaves the original untouched and a stale sibling that is discarded
//! on the next open.

use crate::{supersede::SupersededBlockTracker, EngineError, EngineResult};
use emdb_store::RawBlockStore;
use emdb_types::{MaintenanceConfig, SupersededRecord};
use std::{
    collections::HashSet,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};

/// Result of one compaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Blocks copied into the new file.
    pub blocks_copied: usize,
    /// Superseded blocks left behind.
    pub blocks_dropped: usize,
    /// File size before.
    pub bytes_before: u64,
    /// File size after.
    pub bytes_after: u64,
    /// The backup snapshot of the pre-compaction file.
    pub backup: PathBuf,
}

/// Decides when maintenance runs and what it may reclaim.
#[derive(Debug)]
pub struct MaintenanceManager {
    store: Arc<RawBlockStore>,
    tracker: Arc<SupersededBlockTracker>,
    config: MaintenanceConfig,
}

impl MaintenanceManager {
    /// Creates the manager over shared store and tracker handles.
    pub const fn new(
        store: Arc<RawBlockStore>,
        tracker: Arc<SupersededBlockTracker>,
        config: MaintenanceConfig,
    ) -> Self {
        Self { store, tracker, config }
    }

    /// The active configuration.
    pub const fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Superseded blocks old enough to reclaim: the supersession records
    /// intersected with what is actually still in the file, minus
    /// anything younger than the deletion age floor.
    pub fn identify_superseded_blocks(&self, now_ms: i64) -> Vec<SupersededRecord> {
        let cutoff = now_ms - (self.config.min_age_hours_for_deletion as i64) * 3_600_000;
        self.tracker.reclaimable(cutoff)
    }

    /// True when the superseded share of the file justifies compaction.
    pub fn should_compact(&self) -> bool {
        if !self.config.enable {
            return false;
        }
        let superseded = self.tracker.superseded_bytes();
        let file_size = self.store.file_size();
        superseded >= self.config.compaction_threshold_bytes
            || (file_size > 0
                && superseded as f64 / file_size as f64 > self.config.compaction_threshold_ratio)
    }
}

/// Removes a stale compaction sibling left by a crash. Called on open;
/// an existing sibling was by definition never swapped in.
pub fn discard_stale_sibling(db_path: &Path) -> std::io::Result<()> {
    let sibling = sibling_path(db_path);
    if sibling.exists() {
        warn!(
            target: "emdb::maintenance",
            sibling = %sibling.display(),
            "discarding stale compaction sibling"
        );
        fs::remove_file(&sibling)?;
    }
    Ok(())
}

fn sibling_path(db_path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.compact", db_path.display()))
}

/// Copies all live blocks except `drop_ids` into a sibling file, then
/// swaps it into place behind a rotated backup. The store must be
/// quiesced; callers reopen it afterwards.
pub fn compact_file(
    store: &RawBlockStore,
    drop_ids: &HashSet<i64>,
    backups_to_keep: usize,
    now_ms: i64,
) -> EngineResult<CompactionOutcome> {
    store.sync()?;
    let db_path = store.path().to_path_buf();
    let sibling = sibling_path(&db_path);
    discard_stale_sibling(&db_path)?;

    // Live blocks in original file order.
    let mut live: Vec<(i64, u64)> = store
        .locations()
        .into_iter()
        .filter(|(id, _)| !drop_ids.contains(id))
        .map(|(id, loc)| (id, loc.offset))
        .collect();
    live.sort_by_key(|(_, offset)| *offset);

    let bytes_before = store.file_size();
    let mut copied = 0usize;
    {
        let file = fs::File::create(&sibling)?;
        let mut writer = BufWriter::new(file);
        for (block_id, _) in &live {
            let bytes = store.read_encoded(*block_id)?;
            writer.write_all(&bytes)?;
            copied += 1;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
    }

    // Snapshot the pre-compaction file, then swap.
    let backup = PathBuf::from(format!("{}.backup.{now_ms}", db_path.display()));
    fs::copy(&db_path, &backup)?;
    fs::rename(&sibling, &db_path)?;
    prune_backups(&db_path, backups_to_keep)?;

    let bytes_after = fs::metadata(&db_path)?.len();
    info!(
        target: "emdb::maintenance",
        copied,
        dropped = drop_ids.len(),
        bytes_before,
        bytes_after,
        "compaction complete"
    );
    Ok(CompactionOutcome {
        blocks_copied: copied,
        blocks_dropped: drop_ids.len(),
        bytes_before,
        bytes_after,
        backup,
    })
}

/// Deletes the oldest backups beyond `keep`. Returns the removed paths.
pub fn prune_backups(db_path: &Path, keep: usize) -> EngineResult<Vec<PathBuf>> {
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let prefix = format!(
        "{}.backup.",
        db_path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
            EngineError::InvalidArgument(format!("bad database path {}", db_path.display()))
        })?
    );

    let mut backups: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    // Timestamp suffixes sort lexicographically within an epoch width,
    // and the filesystem names are all we have after a restart.
    backups.sort();

    let mut removed = Vec::new();
    while backups.len() > keep {
        let victim = backups.remove(0);
        fs::remove_file(&victim)?;
        info!(target: "emdb::maintenance", backup = %victim.display(), "pruned backup");
        removed.push(victim);
    }
    Ok(removed)
}

#[cfg(test)]
mod test {
    use super::*;
    use emdb_store::Block;
    use emdb_types::{BlockType, Encoding};

    const NOW: i64 = 1_700_000_000_000;

    fn block(id: i64, payload: &[u8]) -> Block {
        Block::new(BlockType::Segment, id, NOW, Encoding::RawBytes, payload.to_vec())
    }

    #[test]
    fn compaction_drops_only_the_requested_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.emdb");
        {
            let (store, _) = RawBlockStore::open(&path, true, false).unwrap();
            for id in 1..=10 {
                store.append(&block(id, &[id as u8; 128])).unwrap();
            }
            let drop_ids = HashSet::from([3, 7]);
            let outcome = compact_file(&store, &drop_ids, 3, NOW).unwrap();
            assert_eq!(outcome.blocks_copied, 8);
            assert!(outcome.bytes_after < outcome.bytes_before);
            assert!(outcome.backup.exists());
        }
        let (store, report) = RawBlockStore::open(&path, false, false).unwrap();
        assert_eq!(report.blocks.len(), 8);
        assert!(!store.contains(3) && !store.contains(7));
        assert_eq!(store.read(5).unwrap().payload, vec![5u8; 128]);
    }

    #[test]
    fn stale_sibling_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.emdb");
        let sibling = PathBuf::from(format!("{}.compact", path.display()));
        fs::write(&sibling, b"half-written").unwrap();
        discard_stale_sibling(&path).unwrap();
        assert!(!sibling.exists());
    }

    #[test]
    fn backups_rotate_keeping_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.emdb");
        for ts in [100, 200, 300, 400] {
            fs::write(format!("{}.backup.{ts}", path.display()), b"snapshot").unwrap();
        }
        let removed = prune_backups(&path, 2).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!Path::new(&format!("{}.backup.100", path.display())).exists());
        assert!(!Path::new(&format!("{}.backup.200", path.display())).exists());
        assert!(Path::new(&format!("{}.backup.400", path.display())).exists());
    }

    #[test]
    fn trigger_honors_threshold_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = RawBlockStore::open(dir.path().join("m.emdb"), true, false).unwrap();
        let store = Arc::new(store);
        let ids = Arc::new(emdb_store::BlockIdAllocator::new(100));
        store.append(&block(1, &[0; 4096])).unwrap();
        store.append(&block(2, &[0; 64])).unwrap();

        let tracker = Arc::new(SupersededBlockTracker::empty(store.clone(), ids));
        let config = MaintenanceConfig {
            compaction_threshold_bytes: u64::MAX,
            compaction_threshold_ratio: 0.33,
            ..Default::default()
        };
        let maintenance = MaintenanceManager::new(store, tracker.clone(), config);
        assert!(!maintenance.should_compact());

        // Supersede the big block: ratio shoots past 0.33.
        tracker
            .record(vec![SupersededRecord {
                block_id: 1,
                block_type: BlockType::Segment,
                superseded_at: NOW,
                reason: "test".into(),
            }])
            .unwrap();
        assert!(maintenance.should_compact());
    }
}
