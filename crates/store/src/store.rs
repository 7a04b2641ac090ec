//! The raw block store: one file, one writer, many readers.

use crate::{
    scan::{scan_file, ScanReport},
    Block, StoreError, StoreResult,
};
use emdb_types::{BlockType, HEADER_BLOCK_ID};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, trace};

/// Where a block lives inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    /// Byte offset of the block's magic.
    pub offset: u64,
    /// Full encoded length including checksums.
    pub len: u64,
}

#[derive(Debug)]
struct Inner {
    file: File,
    locations: HashMap<i64, BlockLocation>,
    /// Append position; always the physical end of file.
    end_offset: u64,
    /// Unsynced writes exist.
    dirty: bool,
}

/// Append-only block store over a single file.
///
/// Writers serialize on the internal write lock; readers share it and go
/// through the OS page cache. The in-memory `block_id → location` map is
/// the only state; it is rebuilt by [`scan_file`] on open, so the store is
/// stateless across restarts apart from the file itself.
#[derive(Debug)]
pub struct RawBlockStore {
    path: PathBuf,
    lock_path: Option<PathBuf>,
    read_only: bool,
    inner: RwLock<Inner>,
}

impl RawBlockStore {
    /// Opens (or creates) the block file at `path` and rebuilds the
    /// location index. Returns the store together with the scan report so
    /// higher layers can seed their own state from block types and
    /// timestamps without a second pass.
    pub fn open(
        path: impl AsRef<Path>,
        create_if_missing: bool,
        read_only: bool,
    ) -> StoreResult<(Self, ScanReport)> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() && !create_if_missing {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no database at {}", path.display()),
            )));
        }

        let lock_path = if read_only { None } else { Some(Self::acquire_lock(&path)?) };

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create_if_missing && !read_only)
            .open(&path)?;
        let end_offset = file.metadata()?.len();

        let report = scan_file(&file, end_offset)?;
        let mut locations = HashMap::with_capacity(report.blocks.len());
        for scanned in &report.blocks {
            // Later offset wins for duplicate ids.
            locations.insert(scanned.block_id, scanned.location);
        }
        info!(
            target: "emdb::store",
            path = %path.display(),
            blocks = locations.len(),
            bytes = end_offset,
            "opened block store"
        );

        Ok((
            Self {
                path,
                lock_path,
                read_only,
                inner: RwLock::new(Inner { file, locations, end_offset, dirty: false }),
            },
            report,
        ))
    }

    fn acquire_lock(path: &Path) -> StoreResult<PathBuf> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(lock_path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&lock_path).unwrap_or_default();
                Err(StoreError::AlreadyLocked(holder.trim().to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The file this store owns.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.inner.read().end_offset
    }

    /// Number of indexed blocks.
    pub fn block_count(&self) -> usize {
        self.inner.read().locations.len()
    }

    /// True when `block_id` is live in the index.
    pub fn contains(&self, block_id: i64) -> bool {
        self.inner.read().locations.contains_key(&block_id)
    }

    /// Snapshot of the location index.
    pub fn locations(&self) -> HashMap<i64, BlockLocation> {
        self.inner.read().locations.clone()
    }

    /// Live block ids in unspecified order.
    pub fn block_ids(&self) -> Vec<i64> {
        self.inner.read().locations.keys().copied().collect()
    }

    /// Appends a block at EOF. A duplicate id replaces the older entry in
    /// the index; the older bytes stay on disk until compaction.
    pub fn append(&self, block: &Block) -> StoreResult<BlockLocation> {
        self.append_opts(block, false, false)
    }

    /// Appends and fsyncs before the index is updated, so the new
    /// location is only ever observed durable.
    pub fn append_durable(&self, block: &Block) -> StoreResult<BlockLocation> {
        self.append_opts(block, true, false)
    }

    /// Appends, failing `DuplicateBlockId` when the id is already live.
    pub fn append_unique(&self, block: &Block) -> StoreResult<BlockLocation> {
        self.append_opts(block, false, true)
    }

    fn append_opts(
        &self,
        block: &Block,
        durable: bool,
        require_unique: bool,
    ) -> StoreResult<BlockLocation> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if block.block_id == HEADER_BLOCK_ID && block.block_type != BlockType::Header {
            return Err(StoreError::InvalidArgument(
                "block id 0 is reserved for the header block".into(),
            ));
        }

        let bytes = block.encode();
        let mut inner = self.inner.write();
        if require_unique && inner.locations.contains_key(&block.block_id) {
            return Err(StoreError::DuplicateBlockId(block.block_id));
        }

        let offset = inner.end_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&bytes)?;
        inner.dirty = true;
        if durable {
            inner.file.sync_data()?;
            inner.dirty = false;
        }

        let location = BlockLocation { offset, len: bytes.len() as u64 };
        inner.end_offset = offset + location.len;
        inner.locations.insert(block.block_id, location);
        trace!(
            target: "emdb::store",
            block_id = block.block_id,
            block_type = ?block.block_type,
            offset,
            len = location.len,
            "appended block"
        );
        Ok(location)
    }

    /// Reads and fully validates a block.
    pub fn read(&self, block_id: i64) -> StoreResult<Block> {
        Block::decode(&self.read_encoded(block_id)?)
    }

    /// Reads a block's exact encoded bytes, validating both checksums.
    /// This is what the hash chain hashes and what compaction copies
    /// forward.
    pub fn read_encoded(&self, block_id: i64) -> StoreResult<Vec<u8>> {
        let inner = self.inner.read();
        let location =
            *inner.locations.get(&block_id).ok_or(StoreError::NotFound(block_id))?;
        let mut bytes = vec![0u8; location.len as usize];
        inner.file.read_exact_at(&mut bytes, location.offset)?;
        drop(inner);

        // Validation is part of the read contract.
        Block::decode(&bytes)?;
        debug!(target: "emdb::store", block_id, len = bytes.len(), "read block");
        Ok(bytes)
    }

    /// Flushes outstanding writes to stable storage.
    pub fn sync(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.dirty {
            inner.file.sync_data()?;
            inner.dirty = false;
        }
        Ok(())
    }

    /// Flushes and releases the file and the writer lock.
    pub fn close(self) -> StoreResult<()> {
        self.sync()?;
        Ok(())
    }

    /// Forgets a block id without touching the file. Used after
    /// compaction when a superseded block must stop resolving.
    pub fn evict(&self, block_id: i64) -> bool {
        self.inner.write().locations.remove(&block_id).is_some()
    }
}

impl Drop for RawBlockStore {
    fn drop(&mut self) {
        if let Some(lock_path) = &self.lock_path {
            let _ = std::fs::remove_file(lock_path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use emdb_types::Encoding;

    fn open_temp() -> (tempfile::TempDir, RawBlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = RawBlockStore::open(dir.path().join("t.emdb"), true, false).unwrap();
        (dir, store)
    }

    fn block(id: i64, payload: &[u8]) -> Block {
        Block::new(BlockType::Metadata, id, 1_700_000_000_000, Encoding::RawBytes, payload.to_vec())
    }

    #[test]
    fn append_then_read_roundtrips() {
        let (_dir, store) = open_temp();
        let b = block(54321, b"Unencrypted test data");
        store.append(&b).unwrap();
        let read = store.read(54321).unwrap();
        assert_eq!(read, b);
        assert!(!read.flags.is_encrypted());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.emdb");
        {
            let (store, _) = RawBlockStore::open(&path, true, false).unwrap();
            store.append_durable(&block(54321, b"Unencrypted test data")).unwrap();
            store.close().unwrap();
        }
        let (store, report) = RawBlockStore::open(&path, false, false).unwrap();
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(store.read(54321).unwrap().payload, b"Unencrypted test data");
    }

    #[test]
    fn missing_file_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RawBlockStore::open(dir.path().join("absent.emdb"), false, false).is_err());
    }

    #[test]
    fn duplicate_id_later_append_wins() {
        let (_dir, store) = open_temp();
        store.append(&block(5, b"old")).unwrap();
        store.append(&block(5, b"new")).unwrap();
        assert_eq!(store.read(5).unwrap().payload, b"new");
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn append_unique_rejects_live_id() {
        let (_dir, store) = open_temp();
        store.append(&block(5, b"old")).unwrap();
        assert_eq!(
            store.append_unique(&block(5, b"new")),
            Err(StoreError::DuplicateBlockId(5))
        );
    }

    #[test]
    fn user_block_id_zero_is_reserved() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.append(&block(0, b"nope")),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_unknown_id_is_not_found() {
        let (_dir, store) = open_temp();
        assert_eq!(store.read(99).unwrap_err(), StoreError::NotFound(99));
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.emdb");
        let (_store, _) = RawBlockStore::open(&path, true, false).unwrap();
        assert!(matches!(
            RawBlockStore::open(&path, true, false),
            Err(StoreError::AlreadyLocked(_))
        ));
    }

    #[test]
    fn read_only_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.emdb");
        {
            let (store, _) = RawBlockStore::open(&path, true, false).unwrap();
            store.append_durable(&block(1, b"x")).unwrap();
        }
        let (store, _) = RawBlockStore::open(&path, false, true).unwrap();
        assert_eq!(store.append(&block(2, b"y")).unwrap_err(), StoreError::ReadOnly);
        assert_eq!(store.read(1).unwrap().payload, b"x");
    }
}
