//! The database façade.
//!
//! [`EmailDatabase`] owns one block file and wires the managers
//! together: imports run parser → batch builder → codec → store →
//! indexes, reads run index → store → codec → batch. All public
//! operations speak the wire-visible error taxonomy and the compound
//! [`EmailId`] addressing.

use crate::{
    batch::{AdaptiveBlockSizer, BatchReader, EmailBatchBuilder},
    cache::{FolderCache, PayloadCache},
    chain::{HashChainManager, VerificationResult},
    email::ParsedEmail,
    folders::{FolderManager, FolderMutation},
    maintenance::{compact_file, discard_stale_sibling, CompactionOutcome, MaintenanceManager},
    search,
    search::Query,
    supersede::SupersededBlockTracker,
    txlog::{TxLog, TxTag},
    version::VersionManager,
    CancelToken, EngineError, EngineResult,
};
use emdb_codec::{decode_block, decode_block_raw, encode_block, CodecConfig, KeyManager};
use emdb_index::{IndexStore, IndexValue};
use emdb_store::{BlockIdAllocator, RawBlockStore, ScannedBlock};
use emdb_types::{
    BlockContent, BlockType, Capability, DatabaseOptions, DatabaseVersion, EmailId, Encoding,
    Envelope, MetadataContent, MigrationPlan, SupersededRecord, TargetBlockSize,
    VersionCompatibility,
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Index holding `message_id → EmailId`.
pub const INDEX_MESSAGE_ID: &str = "message-id";
/// Index holding `envelope_hash → EmailId`.
pub const INDEX_ENVELOPE_HASH: &str = "envelope-hash";
/// Index holding `folder_path → [EmailId]`.
pub const INDEX_FOLDER: &str = "folder";
/// Index holding `token → postings`.
pub const INDEX_TERM: &str = "term";
/// Catalog index holding every live email id.
pub const INDEX_EMAILS: &str = "emails";

const ALL_INDEXES: [&str; 5] =
    [INDEX_MESSAGE_ID, INDEX_ENVELOPE_HASH, INDEX_FOLDER, INDEX_TERM, INDEX_EMAILS];

/// One search hit, ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// The matching email.
    pub email_id: EmailId,
    /// Its subject, for display.
    pub subject: String,
    /// Field-weighted relevance.
    pub relevance: f64,
    /// Names of the matched fields.
    pub matched_fields: Vec<String>,
}

/// Outcome of a bulk import.
#[derive(Debug, Default, Clone)]
pub struct BatchResult {
    /// Messages imported.
    pub success_count: usize,
    /// Messages rejected.
    pub error_count: usize,
    /// Per-message failures, `(source name, error)`.
    pub errors: Vec<(String, String)>,
}

/// Point-in-time statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
    /// Live emails.
    pub total_emails: usize,
    /// Blocks in the location index.
    pub storage_blocks: usize,
    /// Secondary index trees.
    pub search_indexes: usize,
    /// Folders in the tree.
    pub total_folders: usize,
    /// File size in bytes.
    pub total_bytes: u64,
    /// Blocks awaiting compaction.
    pub superseded_blocks: usize,
}

/// Outcome of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    /// Version migrated from.
    pub from: DatabaseVersion,
    /// Version migrated to.
    pub to: DatabaseVersion,
    /// Steps executed.
    pub steps_run: usize,
    /// The compaction pass that carried the rewrite, when one ran.
    pub compaction: Option<CompactionOutcome>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn catalog_key(id: EmailId) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&id.batch_id.to_be_bytes());
    key[8..].copy_from_slice(&id.local_id.to_be_bytes());
    key
}

/// An open email database.
#[derive(Debug)]
pub struct EmailDatabase {
    path: PathBuf,
    options: DatabaseOptions,
    keys: Arc<KeyManager>,
    /// `None` only transiently, while a compaction or migration reopen
    /// is in flight; a failed reopen leaves the handle poisoned.
    inner: Option<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<RawBlockStore>,
    ids: Arc<BlockIdAllocator>,
    keys: Arc<KeyManager>,
    codec: CodecConfig,
    index: Arc<IndexStore>,
    folders: FolderManager,
    chain: Option<HashChainManager>,
    tracker: Arc<SupersededBlockTracker>,
    maintenance: MaintenanceManager,
    version: VersionManager,
    txlog: Option<TxLog>,
    payload_cache: Arc<PayloadCache>,
    folder_cache: Arc<FolderCache>,
    builder: Mutex<Option<EmailBatchBuilder>>,
    metadata_block: Mutex<Option<i64>>,
    wal_head: Mutex<Option<i64>>,
    key_manager_blocks: Mutex<Vec<i64>>,
}

impl EmailDatabase {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let keys = Arc::new(KeyManager::new());
        let inner = Inner::open(&path, &options, keys.clone(), false)?;
        Ok(Self { path, options, keys, inner: Some(inner) })
    }

    /// The database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Import ────────────────────────────────────────────────────────

    /// Imports one EML message and returns its stable id.
    pub fn import_eml(&self, bytes: Vec<u8>, source_name: Option<&str>) -> EngineResult<EmailId> {
        self.check_writable()?;
        let parsed = ParsedEmail::parse(bytes)?;
        let now = now_ms();

        let email_id = {
            let mut guard = self.inner().builder.lock();
            let builder = guard.get_or_insert_with(|| {
                let target = match self.options.target_block_size {
                    TargetBlockSize::Auto => {
                        AdaptiveBlockSizer::target_bytes(self.inner().store.file_size())
                    }
                    TargetBlockSize::Fixed(bytes) => bytes,
                };
                EmailBatchBuilder::new(self.inner().ids.next_id(), target, now)
            });
            builder.push(parsed.clone(), now)?
        };

        // All index writes for this email become visible atomically with
        // respect to readers of the per-index locks before the id is
        // reported.
        self.inner().index_email(email_id, &parsed)?;
        self.inner().log(now, TxTag::Import, &format!(
            "{} message-id=<{}> source={}",
            email_id,
            parsed.message_id,
            source_name.unwrap_or("-"),
        ));

        let flush_due = {
            let guard = self.inner().builder.lock();
            guard.as_ref().is_some_and(|b| {
                b.should_flush(now, (self.options.flush_interval_secs.max(1) as i64) * 1000)
            })
        };
        if flush_due {
            self.flush()?;
        }
        Ok(email_id)
    }

    /// Imports many messages, reporting progress and honoring
    /// cancellation between messages. Already-imported messages stay.
    pub fn import_eml_batch<I>(
        &self,
        messages: I,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
        cancel: &CancelToken,
    ) -> EngineResult<BatchResult>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let messages: Vec<(String, Vec<u8>)> = messages.into_iter().collect();
        let total = messages.len();
        let mut result = BatchResult::default();

        for (i, (name, bytes)) in messages.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.import_eml(bytes, Some(&name)) {
                Ok(_) => result.success_count += 1,
                Err(e) => {
                    result.error_count += 1;
                    result.errors.push((name, e.to_string()));
                }
            }
            if let Some(cb) = progress.as_deref_mut() {
                cb(i + 1, total);
            }
        }
        self.flush()?;
        Ok(result)
    }

    /// Flushes the pending batch and any over-threshold index memtables,
    /// then persists a fresh Metadata block when roots changed.
    pub fn flush(&self) -> EngineResult<()> {
        self.check_writable()?;
        let now = now_ms();
        self.inner().flush_pending_batch(now)?;
        let flushed = self.inner().index.flush_if_needed(now)?;
        if !flushed.is_empty() {
            self.inner().persist_metadata(now)?;
        }
        Ok(())
    }

    // ── Retrieval ─────────────────────────────────────────────────────

    /// Returns the email addressed by `id`.
    pub fn get_email(&self, id: EmailId) -> EngineResult<ParsedEmail> {
        // Unflushed batch first.
        {
            let guard = self.inner().builder.lock();
            if let Some(builder) = guard.as_ref() {
                if builder.batch_id() == id.batch_id {
                    return builder
                        .get(id.local_id)
                        .cloned()
                        .ok_or_else(|| EngineError::NotFound(format!("email {id}")));
                }
            }
        }

        let payload = self.inner().batch_payload(id.batch_id)?;
        let reader = BatchReader::new(&payload)?;
        let entry = reader
            .entry(id.local_id)
            .map_err(|_| EngineError::NotFound(format!("email {id}")))?;
        ParsedEmail::parse(entry.raw.to_vec())
    }

    /// Resolves a message id through the index.
    pub fn get_email_by_message_id(&self, message_id: &str) -> EngineResult<ParsedEmail> {
        let key = message_id.trim_matches(['<', '>']);
        let id = self
            .inner()
            .index
            .get_email(INDEX_MESSAGE_ID, key.as_bytes())
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound(format!("message id <{key}>")))?;
        self.get_email(id)
    }

    /// Every live email id, batch order then local order.
    pub fn all_email_ids(&self) -> EngineResult<Vec<EmailId>> {
        Ok(self
            .inner()
            .index
            .range(INDEX_EMAILS, None, None)
            .map_err(EngineError::from)?
            .into_iter()
            .filter_map(|(_, value)| match value {
                IndexValue::Email(id) => Some(id),
                _ => None,
            })
            .collect())
    }

    // ── Folders ───────────────────────────────────────────────────────

    /// Creates a folder; nested paths use `/` and need their parent.
    pub fn create_folder(&self, path: &str) -> EngineResult<()> {
        self.check_writable()?;
        let now = now_ms();
        let mutation = self.inner().folders.create_folder(path, now)?;
        self.inner().commit_folder_mutation(mutation, now)?;
        Ok(())
    }

    /// Adds an email to a folder.
    pub fn add_to_folder(&self, id: EmailId, folder: &str) -> EngineResult<()> {
        self.check_writable()?;
        let parsed = self.get_email(id)?;
        let now = now_ms();
        if let Some(mutation) =
            self.inner().folders.add_email(folder, id, parsed.envelope(id), now)?
        {
            self.inner().folder_index_add(folder, id)?;
            self.inner().commit_folder_mutation(mutation, now)?;
        }
        Ok(())
    }

    /// Removes an email from a folder.
    pub fn remove_from_folder(&self, id: EmailId, folder: &str) -> EngineResult<()> {
        self.check_writable()?;
        let now = now_ms();
        if let Some(mutation) = self.inner().folders.remove_email(folder, id, now)? {
            self.inner().folder_index_remove(folder, id)?;
            self.inner().commit_folder_mutation(mutation, now)?;
        }
        Ok(())
    }

    /// Moves an email between folders as one logical add-then-remove.
    pub fn move_email(&self, id: EmailId, from: &str, to: &str) -> EngineResult<()> {
        self.check_writable()?;
        if !self.inner().folders.members(from)?.contains(&id) {
            return Err(EngineError::NotFound(format!("email {id} in folder `{from}`")));
        }
        self.add_to_folder(id, to)?;
        self.remove_from_folder(id, from)
    }

    /// Deletes an email: removed from every folder, tombstoned in every
    /// index. Its batch bytes remain until compaction.
    pub fn delete_email(&self, id: EmailId) -> EngineResult<()> {
        self.check_writable()?;
        let parsed = self.get_email(id)?;
        let now = now_ms();

        for folder in self.inner().folders.folder_paths() {
            if let Some(mutation) = self.inner().folders.remove_email(&folder, id, now)? {
                self.inner().folder_index_remove(&folder, id)?;
                self.inner().commit_folder_mutation(mutation, now)?;
            }
        }

        let index = &self.inner().index;
        index.delete(INDEX_MESSAGE_ID, parsed.message_id.as_bytes())?;
        index.delete(INDEX_ENVELOPE_HASH, &parsed.envelope_hash)?;
        index.delete(INDEX_EMAILS, &catalog_key(id))?;
        self.inner().remove_term_postings(id, &parsed)?;

        self.inner().log(now, TxTag::Delete, &format!("{id} message-id=<{}>", parsed.message_id));
        Ok(())
    }

    /// Lists a folder from its cached envelope block.
    pub fn list_folder(&self, folder: &str) -> EngineResult<Vec<Envelope>> {
        self.inner().folders.list(folder)
    }

    /// All folder paths, sorted.
    pub fn folders(&self) -> Vec<String> {
        self.inner().folders.folder_paths()
    }

    // ── Search ────────────────────────────────────────────────────────

    /// Searches the corpus. Plain terms AND together; the advanced form
    /// supports `field:value`, `AND`/`OR`/`NOT`, and parentheses.
    pub fn search(&self, query: &str) -> EngineResult<Vec<SearchResult>> {
        let parsed: Query = search::parse_query(query)?;
        let universe = || self.all_email_ids();
        let ranked = search::rank(&self.inner().index, INDEX_TERM, &parsed, &universe)?;

        ranked
            .into_iter()
            .map(|hit| {
                let subject = self
                    .get_email(hit.email_id)
                    .map(|e| e.subject)
                    .unwrap_or_default();
                Ok(SearchResult {
                    email_id: hit.email_id,
                    subject,
                    relevance: hit.score,
                    matched_fields: search::field_names(hit.fields),
                })
            })
            .collect()
    }

    // ── Introspection ─────────────────────────────────────────────────

    /// Point-in-time statistics.
    pub fn stats(&self) -> DbStats {
        DbStats {
            total_emails: self.inner().index.live_len(INDEX_EMAILS),
            storage_blocks: self.inner().store.block_count(),
            search_indexes: ALL_INDEXES.len(),
            total_folders: self.inner().folders.len(),
            total_bytes: self.inner().store.file_size(),
            superseded_blocks: self.inner().tracker.superseded_ids().len(),
        }
    }

    /// The file's format version.
    pub fn version(&self) -> DatabaseVersion {
        self.inner().version.version()
    }

    /// Compatibility verdict of the file against this build.
    pub fn compatibility(&self) -> VersionCompatibility {
        self.inner().version.compatibility()
    }

    /// Plans a migration to `target`.
    pub fn plan_migration(&self, target: DatabaseVersion) -> MigrationPlan {
        self.inner().version.plan_migration(target)
    }

    /// Migrates the file to `target` through a copy-forward compaction
    /// pass and a rewritten header block.
    pub fn migrate(&mut self, target: DatabaseVersion) -> EngineResult<MigrationResult> {
        self.check_writable()?;
        let from = self.inner().version.version();
        if VersionCompatibility::classify(from, target) == VersionCompatibility::Unsupported {
            return Err(EngineError::UnsupportedVersion(target));
        }
        let plan = self.inner().version.plan_migration(target);
        if plan.steps.is_empty() && from == target {
            return Ok(MigrationResult { from, to: target, steps_run: 0, compaction: None });
        }

        let now = now_ms();
        self.quiesce(now)?;
        let outcome = compact_file(
            &self.inner().store,
            &self.drop_set(now),
            self.options.maintenance.backups_to_keep,
            now,
        )
        .map_err(|e| EngineError::MigrationFailed(e.to_string()))?;

        self.inner().log(now, TxTag::Migration, &format!("{from} -> {target}"));
        self.reopen(true)?;
        self.inner.as_mut().expect("just reopened").version.finish_migration(target, now)?;
        Ok(MigrationResult {
            from,
            to: target,
            steps_run: plan.steps.len(),
            compaction: Some(outcome),
        })
    }

    // ── Encryption ────────────────────────────────────────────────────

    /// Loads the master key and the persisted key generations.
    pub fn unlock_encryption(&self, master_key: [u8; 32]) -> EngineResult<()> {
        self.inner().version.require_capability(Capability::Encryption)?;
        let contents = self.inner().read_key_manager_contents()?;
        self.keys.unlock(master_key, &contents);
        Ok(())
    }

    /// Zeroizes the master key and all derived keys.
    pub fn lock_encryption(&self) {
        self.keys.lock();
    }

    /// Starts a new key generation. Existing blocks keep decrypting
    /// through their recorded generation; new blocks derive under the
    /// fresh one.
    pub fn rotate_encryption_key(&self) -> EngineResult<u32> {
        self.check_writable()?;
        let generation = self.keys.rotate()?;
        let now = now_ms();
        self.inner().log(now, TxTag::KeyRotation, &format!("generation={generation}"));
        self.inner().persist_metadata(now)?;
        Ok(generation)
    }

    // ── Hash chain ────────────────────────────────────────────────────

    /// Verifies the hash chain, optionally over an inclusive sequence
    /// range.
    pub fn verify_hash_chain(
        &self,
        range: Option<(u64, u64)>,
    ) -> EngineResult<VerificationResult> {
        self.inner().version.require_capability(Capability::HashChain)?;
        self.inner()
            .chain
            .as_ref()
            .ok_or_else(|| {
                EngineError::InvalidArgument("hash chain is disabled for this database".into())
            })?
            .verify(range)
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Superseded blocks old enough to reclaim.
    pub fn identify_superseded_blocks(&self) -> Vec<SupersededRecord> {
        self.inner().maintenance.identify_superseded_blocks(now_ms())
    }

    /// True when the superseded share of the file justifies compaction.
    pub fn should_compact(&self) -> bool {
        self.inner().maintenance.should_compact()
    }

    /// Rewrites the file keeping only live blocks, behind a rotated
    /// backup, honoring cancellation before the rewrite starts.
    pub fn compact(&mut self, cancel: &CancelToken) -> EngineResult<CompactionOutcome> {
        self.check_writable()?;
        let now = now_ms();
        self.quiesce(now)?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Fold each index's segment stack first so the old runs become
        // reclaimable (immediately only when the deletion age allows).
        let mut merged_any = false;
        for name in ALL_INDEXES {
            if let Some(outcome) = self.inner().index.merge(name, now)? {
                let records = outcome
                    .superseded
                    .iter()
                    .map(|&block_id| SupersededRecord {
                        block_id,
                        block_type: BlockType::ZoneTreeSegmentKv,
                        superseded_at: now,
                        reason: "segment merge".into(),
                    })
                    .collect();
                if let Some(wal_block) = self.inner().tracker.record(records)? {
                    *self.inner().wal_head.lock() = Some(wal_block);
                }
                merged_any = true;
            }
        }
        if merged_any {
            self.inner().persist_metadata(now)?;
            self.inner().store.sync()?;
        }

        let drop_set = self.drop_set(now);
        let outcome = compact_file(
            &self.inner().store,
            &drop_set,
            self.options.maintenance.backups_to_keep,
            now,
        )?;
        self.inner().log(
            now,
            TxTag::Compaction,
            &format!("dropped {} blocks", outcome.blocks_dropped),
        );
        self.reopen(false)?;
        Ok(outcome)
    }

    /// Flushes all pending state and closes the database.
    pub fn close(self) -> EngineResult<()> {
        if !self.options.read_only {
            let now = now_ms();
            self.quiesce_ref(now)?;
            self.inner().log(now, TxTag::Shutdown, "clean shutdown");
        }
        self.inner().store.sync()?;
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn check_writable(&self) -> EngineResult<()> {
        if self.options.read_only {
            return Err(EngineError::InvalidArgument("database is read-only".into()));
        }
        Ok(())
    }

    fn quiesce(&mut self, now: i64) -> EngineResult<()> {
        self.quiesce_ref(now)
    }

    fn quiesce_ref(&self, now: i64) -> EngineResult<()> {
        self.inner().flush_pending_batch(now)?;
        self.inner().index.flush_all(now)?;
        self.inner().persist_metadata(now)?;
        self.inner().store.sync()?;
        Ok(())
    }

    fn drop_set(&self, now: i64) -> HashSet<i64> {
        self.inner()
            .maintenance
            .identify_superseded_blocks(now)
            .into_iter()
            .map(|r| r.block_id)
            .collect()
    }

    fn inner(&self) -> &Inner {
        self.inner.as_ref().expect("database handle is poisoned by a failed reopen")
    }

    fn reopen(&mut self, tolerate_version: bool) -> EngineResult<()> {
        // Drop the old state first: the writer lock must be released
        // before the fresh open reacquires it.
        self.inner = None;
        let inner = Inner::open(&self.path, &self.options, self.keys.clone(), tolerate_version)?;
        self.inner = Some(inner);
        self.inner().tracker.prune_missing();
        Ok(())
    }
}

impl Inner {
    fn open(
        path: &Path,
        options: &DatabaseOptions,
        keys: Arc<KeyManager>,
        tolerate_version: bool,
    ) -> EngineResult<Self> {
        discard_stale_sibling(path)?;
        let (store, scan) =
            RawBlockStore::open(path, options.create_if_missing, options.read_only)?;
        let store = Arc::new(store);
        let fresh = store.block_count() == 0;
        let ids =
            Arc::new(BlockIdAllocator::after(scan.blocks.iter().map(|b| b.block_id)));
        let now = now_ms();

        let version = if fresh {
            if options.read_only {
                return Err(EngineError::NotFound(format!("database at {}", path.display())));
            }
            VersionManager::create(store.clone(), now)?
        } else if tolerate_version {
            VersionManager::open_unchecked(store.clone())?
        } else {
            VersionManager::open(store.clone())?
        };

        let codec = CodecConfig {
            compression: options.compression_default,
            encryption: options.encryption_default,
        };

        // Newest Metadata block wins; ids are monotone.
        let metadata_block = scan
            .blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Metadata)
            .map(|b| b.block_id)
            .max();
        let metadata = match metadata_block {
            Some(block_id) => match decode_block(&store.read(block_id)?, None)? {
                BlockContent::Metadata(metadata) => metadata,
                other => {
                    return Err(EngineError::CorruptHeader(format!(
                        "metadata block {block_id} holds {:?}",
                        other.block_type()
                    )))
                }
            },
            None => MetadataContent::default(),
        };

        // Unlock before anything that may need to decrypt.
        if let Some(master_key) = options.master_key {
            let contents =
                read_key_manager_blocks(&store, &metadata.key_manager_blocks)?;
            keys.unlock(master_key, &contents);
        }

        let wal_blocks: Vec<i64> = scan
            .blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Wal)
            .map(|b| b.block_id)
            .collect();
        let tracker = Arc::new(SupersededBlockTracker::load(
            store.clone(),
            ids.clone(),
            &wal_blocks,
            None,
        ));

        let index = Arc::new(IndexStore::new(
            store.clone(),
            ids.clone(),
            codec,
            Some(keys.clone()),
        ));
        for name in ALL_INDEXES {
            let roots = metadata.index_roots.get(name).cloned().unwrap_or_default();
            index.open_tree(name, &roots)?;
        }

        let payload_cache = Arc::new(PayloadCache::new(
            options.cache.payload_entries_max,
            options.cache.payload_bytes_max,
        ));
        let folder_cache = Arc::new(FolderCache::new(options.cache.folder_entries_max));

        let folders = FolderManager::load(
            store.clone(),
            ids.clone(),
            codec,
            Some(keys.clone()),
            folder_cache.clone(),
            metadata.folder_tree,
        )?;

        let chain = if options.hash_chain {
            let chain_blocks: Vec<i64> = scan
                .blocks
                .iter()
                .filter(|b| b.block_type == BlockType::HashChain)
                .map(|b| b.block_id)
                .collect();
            Some(HashChainManager::load(store.clone(), ids.clone(), &chain_blocks)?)
        } else {
            None
        };

        let maintenance = MaintenanceManager::new(
            store.clone(),
            tracker.clone(),
            options.maintenance.clone(),
        );

        let txlog = if options.read_only {
            None
        } else {
            let txlog = TxLog::open(path)?;
            txlog.record(
                now,
                TxTag::Startup,
                &format!("version={} blocks={}", version.version(), store.block_count()),
                None,
            );
            Some(txlog)
        };

        let inner = Self {
            store,
            ids,
            keys: keys.clone(),
            codec,
            index,
            folders,
            chain,
            tracker,
            maintenance,
            version,
            txlog,
            payload_cache,
            folder_cache,
            builder: Mutex::new(None),
            metadata_block: Mutex::new(metadata_block),
            wal_head: Mutex::new(metadata.wal_head),
            key_manager_blocks: Mutex::new(metadata.key_manager_blocks),
        };

        if !options.read_only {
            inner.recover_unindexed_batches(&scan.blocks, keys.is_unlocked())?;
        }
        Ok(inner)
    }

    fn log(&self, now: i64, tag: TxTag, details: &str) {
        if let Some(txlog) = &self.txlog {
            txlog.record(now, tag, details, None);
        }
    }

    /// Indexes one email under its final id.
    fn index_email(&self, id: EmailId, parsed: &ParsedEmail) -> EngineResult<()> {
        let index = &self.index;
        index.upsert(
            INDEX_MESSAGE_ID,
            parsed.message_id.as_bytes(),
            IndexValue::Email(id),
        )?;
        index.upsert(INDEX_ENVELOPE_HASH, &parsed.envelope_hash, IndexValue::Email(id))?;
        index.upsert(INDEX_EMAILS, &catalog_key(id), IndexValue::Email(id))?;

        for (field, text) in [
            (search::FIELD_SUBJECT, parsed.subject.as_str()),
            (search::FIELD_FROM, parsed.from.as_str()),
            (search::FIELD_TO, parsed.to.as_str()),
            (search::FIELD_BODY, parsed.body_text.as_str()),
        ] {
            for (token, posting) in search::field_postings(id, field, text) {
                let mut postings =
                    self.index.get_postings(INDEX_TERM, token.as_bytes())?.unwrap_or_default();
                postings.push(posting);
                index.upsert(INDEX_TERM, token.as_bytes(), IndexValue::Postings(postings))?;
            }
        }
        Ok(())
    }

    /// Removes one email's postings from the term index.
    fn remove_term_postings(&self, id: EmailId, parsed: &ParsedEmail) -> EngineResult<()> {
        let mut tokens: HashSet<String> = HashSet::new();
        for text in [&parsed.subject, &parsed.from, &parsed.to, &parsed.body_text] {
            tokens.extend(search::tokenize(text));
        }
        for token in tokens {
            let Some(mut postings) = self.index.get_postings(INDEX_TERM, token.as_bytes())?
            else {
                continue;
            };
            postings.retain(|p| p.email_id != id);
            if postings.is_empty() {
                self.index.delete(INDEX_TERM, token.as_bytes())?;
            } else {
                self.index.upsert(INDEX_TERM, token.as_bytes(), IndexValue::Postings(postings))?;
            }
        }
        Ok(())
    }

    fn folder_index_add(&self, folder: &str, id: EmailId) -> EngineResult<()> {
        let mut members = self
            .index
            .get_email_list(INDEX_FOLDER, folder.as_bytes())?
            .unwrap_or_default();
        if !members.contains(&id) {
            members.push(id);
            self.index.upsert(INDEX_FOLDER, folder.as_bytes(), IndexValue::EmailList(members))?;
        }
        Ok(())
    }

    fn folder_index_remove(&self, folder: &str, id: EmailId) -> EngineResult<()> {
        if let Some(mut members) = self.index.get_email_list(INDEX_FOLDER, folder.as_bytes())? {
            members.retain(|m| *m != id);
            if members.is_empty() {
                self.index.delete(INDEX_FOLDER, folder.as_bytes())?;
            } else {
                self.index.upsert(INDEX_FOLDER, folder.as_bytes(), IndexValue::EmailList(members))?;
            }
        }
        Ok(())
    }

    /// Records a folder mutation's supersessions, chains its appended
    /// blocks, and persists fresh Metadata.
    fn commit_folder_mutation(
        &self,
        mutation: FolderMutation,
        now: i64,
    ) -> EngineResult<()> {
        for record in &mutation.superseded {
            self.payload_cache.invalidate(record.block_id);
            self.log(
                now,
                TxTag::DeleteBlock,
                &format!("{} superseded: {}", record.block_id, record.reason),
            );
        }
        if let Some(wal_block) = self.tracker.record(mutation.superseded)? {
            *self.wal_head.lock() = Some(wal_block);
        }
        if let Some(chain) = &self.chain {
            for block_id in &mutation.appended {
                chain.append_entry(*block_id, now)?;
            }
        }
        self.persist_metadata(now)
    }

    /// Freezes and writes the pending batch, then chains it.
    fn flush_pending_batch(&self, now: i64) -> EngineResult<()> {
        let mut guard = self.builder.lock();
        let Some(builder) = guard.as_mut() else {
            return Ok(());
        };
        if builder.is_empty() {
            return Ok(());
        }

        let batch_id = builder.batch_id();
        let count = builder.len();
        let payload = builder.serialize_block();
        *guard = None;
        drop(guard);

        let block = encode_block(
            &BlockContent::Raw(payload),
            BlockType::EmailBatch,
            batch_id,
            now,
            Encoding::RawBytes,
            self.codec,
            self.index_keys(),
        )?;
        self.store.append_durable(&block)?;
        self.log(now, TxTag::Flush, &format!("batch {batch_id} emails={count}"));
        if let Some(chain) = &self.chain {
            chain.append_entry(batch_id, now)?;
        }
        debug!(target: "emdb::db", batch_id, count, "flushed email batch");
        Ok(())
    }

    fn index_keys(&self) -> Option<&KeyManager> {
        Some(self.keys.as_ref())
    }

    /// Reads a batch block's decoded payload through the cache.
    fn batch_payload(&self, batch_id: i64) -> EngineResult<Arc<Vec<u8>>> {
        if let Some(payload) = self.payload_cache.get(batch_id) {
            return Ok(payload);
        }
        let block = self.store.read(batch_id)?;
        if block.block_type != BlockType::EmailBatch {
            return Err(EngineError::NotFound(format!("email batch {batch_id}")));
        }
        let payload = Arc::new(decode_block_raw(&block, self.index_keys())?);
        self.payload_cache.put(batch_id, payload.clone());
        Ok(payload)
    }

    fn read_key_manager_contents(
        &self,
    ) -> EngineResult<Vec<emdb_types::KeyManagerContent>> {
        read_key_manager_blocks(&self.store, &self.key_manager_blocks.lock())
    }

    /// Writes the authoritative root-pointer block and supersedes its
    /// predecessor. Pending wrapped keys are persisted first so the new
    /// Metadata can point at them.
    fn persist_metadata(&self, now: i64) -> EngineResult<()> {
        // Persist newly wrapped keys, bounding the retained generations.
        if let Some(keys) = self.index_keys() {
            if let Ok(Some(content)) = keys.take_pending() {
                let block_id = self.ids.next_id();
                let block = encode_block(
                    &BlockContent::KeyManager(content),
                    BlockType::KeyManager,
                    block_id,
                    now,
                    Encoding::Json,
                    CodecConfig::PLAIN,
                    None,
                )?;
                self.store.append(&block)?;
                let mut km_blocks = self.key_manager_blocks.lock();
                km_blocks.push(block_id);
                let keep = self.maintenance.config().key_versions_to_keep as usize;
                while km_blocks.len() > keep.max(1) {
                    let old = km_blocks.remove(0);
                    let wal_block = self.tracker.record(vec![SupersededRecord {
                        block_id: old,
                        block_type: BlockType::KeyManager,
                        superseded_at: now,
                        reason: "key manager rotation".into(),
                    }])?;
                    if let Some(wal_block) = wal_block {
                        *self.wal_head.lock() = Some(wal_block);
                    }
                }
            }
        }

        let metadata = MetadataContent {
            wal_head: *self.wal_head.lock(),
            index_roots: self.index.roots(),
            folder_tree: self.folders.tree_block(),
            hash_chain_head: self.chain.as_ref().and_then(|c| c.head()),
            key_manager_blocks: self.key_manager_blocks.lock().clone(),
        };

        let block_id = self.ids.next_id();
        let block = encode_block(
            &BlockContent::Metadata(metadata),
            BlockType::Metadata,
            block_id,
            now,
            Encoding::Json,
            CodecConfig::PLAIN,
            None,
        )?;
        self.store.append_durable(&block)?;

        let old = self.metadata_block.lock().replace(block_id);
        if let Some(old) = old {
            let wal_block = self.tracker.record(vec![SupersededRecord {
                block_id: old,
                block_type: BlockType::Metadata,
                superseded_at: now,
                reason: "metadata update".into(),
            }])?;
            if let Some(wal_block) = wal_block {
                *self.wal_head.lock() = Some(wal_block);
            }
        }
        debug!(target: "emdb::db", block_id, "persisted metadata");
        Ok(())
    }

    /// Reindexes email batches that are on disk but absent from the
    /// catalog index, which is the crash-recovery path behind the scan.
    fn recover_unindexed_batches(
        &self,
        scanned: &[ScannedBlock],
        unlocked: bool,
    ) -> EngineResult<()> {
        for block in scanned {
            if block.block_type != BlockType::EmailBatch {
                continue;
            }
            // A tombstone also counts: a fully deleted batch must not be
            // resurrected by recovery.
            let probe = catalog_key(EmailId::new(block.block_id, 0));
            if self.index.has_entry(INDEX_EMAILS, &probe) {
                continue;
            }

            let payload = match self.batch_payload(block.block_id) {
                Ok(payload) => payload,
                Err(EngineError::NotUnlocked) if !unlocked => {
                    warn!(
                        target: "emdb::db",
                        batch = block.block_id,
                        "cannot reindex encrypted batch while locked"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        target: "emdb::db",
                        batch = block.block_id,
                        error = %e,
                        "skipping unreadable batch during recovery"
                    );
                    continue;
                }
            };

            let reader = BatchReader::new(&payload)?;
            let mut recovered = 0usize;
            for entry in reader.iter() {
                let id = EmailId::new(block.block_id, entry.local_id);
                match ParsedEmail::parse(entry.raw.to_vec()) {
                    Ok(parsed) => {
                        self.index_email(id, &parsed)?;
                        recovered += 1;
                    }
                    Err(e) => {
                        warn!(target: "emdb::db", %id, error = %e, "unparseable email in batch")
                    }
                }
            }
            if recovered > 0 {
                info!(
                    target: "emdb::db",
                    batch = block.block_id,
                    recovered,
                    "reindexed batch missing from the catalog"
                );
            }
        }
        Ok(())
    }
}

fn read_key_manager_blocks(
    store: &RawBlockStore,
    block_ids: &[i64],
) -> EngineResult<Vec<emdb_types::KeyManagerContent>> {
    let mut contents = Vec::with_capacity(block_ids.len());
    for &block_id in block_ids {
        match decode_block(&store.read(block_id)?, None)? {
            BlockContent::KeyManager(content) => contents.push(content),
            other => {
                return Err(EngineError::CorruptHeader(format!(
                    "key manager block {block_id} holds {:?}",
                    other.block_type()
                )))
            }
        }
    }
    Ok(contents)
}
