//! Folder management.
//!
//! Folder state is three block kinds chained by ids: Folder blocks hold
//! membership, FolderEnvelope blocks hold the cached listing (linked to
//! their predecessor), and the FolderTree block maps paths to the
//! current blocks. Every mutation appends fresh versions of all three
//! and reports the replaced blocks for supersession; nothing is ever
//! rewritten in place.

use crate::{cache::FolderCache, EngineError, EngineResult};
use emdb_codec::{decode_block, encode_block, CodecConfig, KeyManager};
use emdb_store::{BlockIdAllocator, RawBlockStore};
use emdb_types::{
    BlockContent, BlockType, EmailId, Encoding, Envelope, FolderContent, FolderEnvelopeContent,
    FolderTree, SupersededRecord,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of one folder mutation: which blocks were appended and which
/// became superseded. The façade records the supersessions and persists
/// a new Metadata block.
#[derive(Debug, Default, Clone)]
pub struct FolderMutation {
    /// Blocks appended by the mutation, in append order.
    pub appended: Vec<i64>,
    /// Blocks replaced by the mutation.
    pub superseded: Vec<SupersededRecord>,
    /// The new FolderTree block.
    pub tree_block: i64,
}

/// Owns the folder tree and the append cascade for folder mutations.
#[derive(Debug)]
pub struct FolderManager {
    store: Arc<RawBlockStore>,
    ids: Arc<BlockIdAllocator>,
    codec: CodecConfig,
    keys: Option<Arc<KeyManager>>,
    cache: Arc<FolderCache>,
    tree: Mutex<TreeState>,
}

#[derive(Debug)]
struct TreeState {
    tree: FolderTree,
    /// Block currently holding the tree, `None` for a fresh database.
    tree_block: Option<i64>,
}

impl FolderManager {
    /// Loads folder state from `tree_block` (the newest Metadata's
    /// pointer), or starts empty.
    pub fn load(
        store: Arc<RawBlockStore>,
        ids: Arc<BlockIdAllocator>,
        codec: CodecConfig,
        keys: Option<Arc<KeyManager>>,
        cache: Arc<FolderCache>,
        tree_block: Option<i64>,
    ) -> EngineResult<Self> {
        let tree = match tree_block {
            Some(block_id) => {
                let block = store.read(block_id)?;
                match decode_block(&block, keys.as_deref())? {
                    BlockContent::FolderTree(tree) => tree,
                    other => {
                        return Err(EngineError::CorruptHeader(format!(
                            "block {block_id} holds {:?}, expected a folder tree",
                            other.block_type()
                        )))
                    }
                }
            }
            None => FolderTree { next_folder_id: 1, ..Default::default() },
        };
        info!(target: "emdb::folders", folders = tree.folders.len(), "loaded folder tree");
        Ok(Self { store, ids, codec, keys, cache, tree: Mutex::new(TreeState { tree, tree_block }) })
    }

    fn keys(&self) -> Option<&KeyManager> {
        self.keys.as_deref()
    }

    fn append_content(
        &self,
        content: &BlockContent,
        block_type: BlockType,
        now_ms: i64,
    ) -> EngineResult<i64> {
        let block_id = self.ids.next_id();
        let block = encode_block(
            content,
            block_type,
            block_id,
            now_ms,
            Encoding::Json,
            self.codec,
            self.keys(),
        )?;
        self.store.append(&block)?;
        Ok(block_id)
    }

    fn read_folder(&self, path: &str, block_id: i64) -> EngineResult<FolderContent> {
        if let Some(content) = self.cache.get(path) {
            return Ok(content);
        }
        let block = self.store.read(block_id)?;
        match decode_block(&block, self.keys())? {
            BlockContent::Folder(content) => {
                self.cache.put(path.to_owned(), content.clone());
                Ok(content)
            }
            other => Err(EngineError::CorruptHeader(format!(
                "block {block_id} holds {:?}, expected folder content",
                other.block_type()
            ))),
        }
    }

    fn read_envelopes(&self, block_id: i64) -> EngineResult<FolderEnvelopeContent> {
        let block = self.store.read(block_id)?;
        match decode_block(&block, self.keys())? {
            BlockContent::FolderEnvelope(content) => Ok(content),
            other => Err(EngineError::CorruptHeader(format!(
                "block {block_id} holds {:?}, expected a folder envelope",
                other.block_type()
            ))),
        }
    }

    /// Appends the updated tree block and records the supersession of
    /// its predecessor into `mutation`.
    fn commit_tree(
        &self,
        state: &mut TreeState,
        mutation: &mut FolderMutation,
        now_ms: i64,
    ) -> EngineResult<()> {
        let tree_block =
            self.append_content(&BlockContent::FolderTree(state.tree.clone()), BlockType::FolderTree, now_ms)?;
        mutation.appended.push(tree_block);
        if let Some(old) = state.tree_block.replace(tree_block) {
            mutation.superseded.push(SupersededRecord {
                block_id: old,
                block_type: BlockType::FolderTree,
                superseded_at: now_ms,
                reason: "folder tree update".into(),
            });
        }
        mutation.tree_block = tree_block;
        Ok(())
    }

    /// Creates a folder. Nested paths use `/`; the parent must exist.
    pub fn create_folder(&self, path: &str, now_ms: i64) -> EngineResult<FolderMutation> {
        if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
            return Err(EngineError::InvalidArgument(format!("invalid folder path `{path}`")));
        }
        let mut state = self.tree.lock();
        if state.tree.folders.contains_key(path) {
            return Err(EngineError::AlreadyExists(format!("folder `{path}`")));
        }
        let (parent_folder_id, name) = match path.rsplit_once('/') {
            Some((parent, leaf)) => {
                let parent_id = *state
                    .tree
                    .folders
                    .get(parent)
                    .ok_or_else(|| EngineError::NotFound(format!("parent folder `{parent}`")))?;
                (Some(parent_id), leaf.to_owned())
            }
            None => (None, path.to_owned()),
        };

        let folder_id = state.tree.next_folder_id;
        state.tree.next_folder_id += 1;

        let content = FolderContent {
            folder_id,
            name,
            parent_folder_id,
            email_ids: Vec::new(),
            version: 1,
        };
        let envelopes = FolderEnvelopeContent {
            folder_path: path.to_owned(),
            version: 1,
            last_modified: now_ms,
            envelopes: Vec::new(),
            previous_block_id: None,
        };

        let mut mutation = FolderMutation::default();
        let folder_block =
            self.append_content(&BlockContent::Folder(content.clone()), BlockType::Folder, now_ms)?;
        let envelope_block = self.append_content(
            &BlockContent::FolderEnvelope(envelopes),
            BlockType::FolderEnvelope,
            now_ms,
        )?;
        mutation.appended.extend([folder_block, envelope_block]);

        state.tree.folders.insert(path.to_owned(), folder_id);
        state.tree.folder_blocks.insert(folder_id, folder_block);
        state.tree.envelope_blocks.insert(folder_id, envelope_block);
        self.commit_tree(&mut state, &mut mutation, now_ms)?;

        self.cache.put(path.to_owned(), content);
        info!(target: "emdb::folders", path, folder_id, "created folder");
        Ok(mutation)
    }

    /// Appends `email_id` to a folder. Returns `None` when the email is
    /// already a member (membership is a set; no duplicates).
    pub fn add_email(
        &self,
        path: &str,
        email_id: EmailId,
        envelope: Envelope,
        now_ms: i64,
    ) -> EngineResult<Option<FolderMutation>> {
        self.mutate_membership(path, now_ms, |content, envelopes| {
            if content.email_ids.contains(&email_id) {
                return false;
            }
            content.email_ids.push(email_id);
            envelopes.envelopes.push(envelope.clone());
            true
        })
    }

    /// Removes `email_id` from a folder. Returns `None` when the email
    /// was not a member.
    pub fn remove_email(
        &self,
        path: &str,
        email_id: EmailId,
        now_ms: i64,
    ) -> EngineResult<Option<FolderMutation>> {
        self.mutate_membership(path, now_ms, |content, envelopes| {
            let before = content.email_ids.len();
            content.email_ids.retain(|id| *id != email_id);
            envelopes.envelopes.retain(|e| e.email_id != email_id);
            content.email_ids.len() != before
        })
    }

    fn mutate_membership(
        &self,
        path: &str,
        now_ms: i64,
        apply: impl FnOnce(&mut FolderContent, &mut FolderEnvelopeContent) -> bool,
    ) -> EngineResult<Option<FolderMutation>> {
        let mut state = self.tree.lock();
        let folder_id = *state
            .tree
            .folders
            .get(path)
            .ok_or_else(|| EngineError::NotFound(format!("folder `{path}`")))?;
        let old_folder_block = state.tree.folder_blocks[&folder_id];
        let old_envelope_block = state.tree.envelope_blocks[&folder_id];

        let mut content = self.read_folder(path, old_folder_block)?;
        let mut envelopes = self.read_envelopes(old_envelope_block)?;
        if !apply(&mut content, &mut envelopes) {
            return Ok(None);
        }
        content.version += 1;
        envelopes.version = content.version;
        envelopes.last_modified = now_ms;
        envelopes.previous_block_id = Some(old_envelope_block);

        let mut mutation = FolderMutation::default();
        let folder_block =
            self.append_content(&BlockContent::Folder(content.clone()), BlockType::Folder, now_ms)?;
        let envelope_block = self.append_content(
            &BlockContent::FolderEnvelope(envelopes),
            BlockType::FolderEnvelope,
            now_ms,
        )?;
        mutation.appended.extend([folder_block, envelope_block]);
        for (old, block_type, reason) in [
            (old_folder_block, BlockType::Folder, "folder update"),
            (old_envelope_block, BlockType::FolderEnvelope, "folder envelope update"),
        ] {
            mutation.superseded.push(SupersededRecord {
                block_id: old,
                block_type,
                superseded_at: now_ms,
                reason: reason.into(),
            });
        }

        state.tree.folder_blocks.insert(folder_id, folder_block);
        state.tree.envelope_blocks.insert(folder_id, envelope_block);
        self.commit_tree(&mut state, &mut mutation, now_ms)?;

        self.cache.put(path.to_owned(), content);
        debug!(target: "emdb::folders", path, tree_block = mutation.tree_block, "folder mutated");
        Ok(Some(mutation))
    }

    /// Deletes a folder. Fails while child folders exist; member emails
    /// simply lose this membership.
    pub fn delete_folder(&self, path: &str, now_ms: i64) -> EngineResult<FolderMutation> {
        let mut state = self.tree.lock();
        let folder_id = *state
            .tree
            .folders
            .get(path)
            .ok_or_else(|| EngineError::NotFound(format!("folder `{path}`")))?;
        let prefix = format!("{path}/");
        if state.tree.folders.keys().any(|p| p.starts_with(&prefix)) {
            return Err(EngineError::InvalidArgument(format!(
                "folder `{path}` still has child folders"
            )));
        }

        let folder_block = state.tree.folder_blocks.remove(&folder_id);
        let envelope_block = state.tree.envelope_blocks.remove(&folder_id);
        state.tree.folders.remove(path);

        let mut mutation = FolderMutation::default();
        for (old, block_type, reason) in [
            (folder_block, BlockType::Folder, "folder delete"),
            (envelope_block, BlockType::FolderEnvelope, "folder delete"),
        ] {
            if let Some(block_id) = old {
                mutation.superseded.push(SupersededRecord {
                    block_id,
                    block_type,
                    superseded_at: now_ms,
                    reason: reason.into(),
                });
            }
        }
        self.commit_tree(&mut state, &mut mutation, now_ms)?;

        self.cache.invalidate(path);
        info!(target: "emdb::folders", path, "deleted folder");
        Ok(mutation)
    }

    /// Lists a folder from its head envelope block: O(1) per envelope,
    /// no batch reads.
    pub fn list(&self, path: &str) -> EngineResult<Vec<Envelope>> {
        let envelope_block = {
            let state = self.tree.lock();
            let folder_id = *state
                .tree
                .folders
                .get(path)
                .ok_or_else(|| EngineError::NotFound(format!("folder `{path}`")))?;
            state.tree.envelope_blocks[&folder_id]
        };
        Ok(self.read_envelopes(envelope_block)?.envelopes)
    }

    /// Current membership of a folder.
    pub fn members(&self, path: &str) -> EngineResult<Vec<EmailId>> {
        let folder_block = {
            let state = self.tree.lock();
            let folder_id = *state
                .tree
                .folders
                .get(path)
                .ok_or_else(|| EngineError::NotFound(format!("folder `{path}`")))?;
            state.tree.folder_blocks[&folder_id]
        };
        Ok(self.read_folder(path, folder_block)?.email_ids)
    }

    /// All folder paths, sorted.
    pub fn folder_paths(&self) -> Vec<String> {
        self.tree.lock().tree.folders.keys().cloned().collect()
    }

    /// True when `path` exists.
    pub fn contains(&self, path: &str) -> bool {
        self.tree.lock().tree.folders.contains_key(path)
    }

    /// Folder count.
    pub fn len(&self) -> usize {
        self.tree.lock().tree.folders.len()
    }

    /// True when no folder exists.
    pub fn is_empty(&self) -> bool {
        self.tree.lock().tree.folders.is_empty()
    }

    /// The current FolderTree block for Metadata, `None` on a fresh
    /// database.
    pub fn tree_block(&self) -> Option<i64> {
        self.tree.lock().tree_block
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn fixture() -> (tempfile::TempDir, Arc<RawBlockStore>, FolderManager) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = RawBlockStore::open(dir.path().join("f.emdb"), true, false).unwrap();
        let store = Arc::new(store);
        let manager = FolderManager::load(
            store.clone(),
            Arc::new(BlockIdAllocator::new(1000)),
            CodecConfig::PLAIN,
            None,
            Arc::new(FolderCache::new(16)),
            None,
        )
        .unwrap();
        (dir, store, manager)
    }

    fn envelope(id: EmailId) -> Envelope {
        Envelope { email_id: id, subject: format!("mail {id}"), ..Default::default() }
    }

    #[test]
    fn create_add_list() {
        let (_dir, _store, folders) = fixture();
        folders.create_folder("Inbox", NOW).unwrap();
        let id = EmailId::new(10, 0);
        folders.add_email("Inbox", id, envelope(id), NOW).unwrap().unwrap();

        assert_eq!(folders.members("Inbox").unwrap(), vec![id]);
        let listed = folders.list("Inbox").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].email_id, id);
    }

    #[test]
    fn duplicate_create_fails() {
        let (_dir, _store, folders) = fixture();
        folders.create_folder("Inbox", NOW).unwrap();
        assert!(matches!(
            folders.create_folder("Inbox", NOW),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn duplicate_membership_is_a_noop() {
        let (_dir, _store, folders) = fixture();
        folders.create_folder("Inbox", NOW).unwrap();
        let id = EmailId::new(10, 0);
        folders.add_email("Inbox", id, envelope(id), NOW).unwrap().unwrap();
        assert!(folders.add_email("Inbox", id, envelope(id), NOW).unwrap().is_none());
        assert_eq!(folders.members("Inbox").unwrap().len(), 1);
    }

    #[test]
    fn nested_folders_need_their_parent() {
        let (_dir, _store, folders) = fixture();
        assert!(matches!(
            folders.create_folder("Inbox/2024", NOW),
            Err(EngineError::NotFound(_))
        ));
        folders.create_folder("Inbox", NOW).unwrap();
        folders.create_folder("Inbox/2024", NOW).unwrap();
        assert!(folders.contains("Inbox/2024"));
        // Parent cannot be deleted while the child exists.
        assert!(matches!(
            folders.delete_folder("Inbox", NOW),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn mutations_supersede_prior_blocks_and_version_increases() {
        let (_dir, _store, folders) = fixture();
        let created = folders.create_folder("Inbox", NOW).unwrap();
        assert!(created.superseded.is_empty());

        let id = EmailId::new(10, 0);
        let mutation = folders.add_email("Inbox", id, envelope(id), NOW).unwrap().unwrap();
        // Old folder, old envelope, old tree.
        assert_eq!(mutation.superseded.len(), 3);
        let types: Vec<BlockType> =
            mutation.superseded.iter().map(|r| r.block_type).collect();
        assert!(types.contains(&BlockType::Folder));
        assert!(types.contains(&BlockType::FolderEnvelope));
        assert!(types.contains(&BlockType::FolderTree));
    }

    #[test]
    fn envelope_chain_links_to_predecessor() {
        let (_dir, store, folders) = fixture();
        folders.create_folder("Inbox", NOW).unwrap();
        let first_envelope_block = {
            let id = EmailId::new(10, 0);
            folders.add_email("Inbox", id, envelope(id), NOW).unwrap().unwrap();
            folders.tree_block().unwrap()
        };
        let id2 = EmailId::new(10, 1);
        folders.add_email("Inbox", id2, envelope(id2), NOW).unwrap().unwrap();

        // Walk the head envelope's previous pointer.
        let state_tree = folders.tree.lock();
        let folder_id = state_tree.tree.folders["Inbox"];
        let head = state_tree.tree.envelope_blocks[&folder_id];
        drop(state_tree);
        let block = store.read(head).unwrap();
        let BlockContent::FolderEnvelope(content) = decode_block(&block, None).unwrap() else {
            panic!("expected envelope content");
        };
        assert_eq!(content.envelopes.len(), 2);
        assert!(content.previous_block_id.is_some());
        assert!(content.previous_block_id.unwrap() < first_envelope_block);
    }

    #[test]
    fn state_survives_reload_via_tree_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.emdb");
        let tree_block;
        {
            let (store, _) = RawBlockStore::open(&path, true, false).unwrap();
            let folders = FolderManager::load(
                Arc::new(store),
                Arc::new(BlockIdAllocator::new(1000)),
                CodecConfig::PLAIN,
                None,
                Arc::new(FolderCache::new(16)),
                None,
            )
            .unwrap();
            folders.create_folder("Inbox", NOW).unwrap();
            let id = EmailId::new(10, 0);
            folders.add_email("Inbox", id, envelope(id), NOW).unwrap().unwrap();
            tree_block = folders.tree_block();
        }
        let (store, _) = RawBlockStore::open(&path, false, false).unwrap();
        let folders = FolderManager::load(
            Arc::new(store),
            Arc::new(BlockIdAllocator::new(5000)),
            CodecConfig::PLAIN,
            None,
            Arc::new(FolderCache::new(16)),
            tree_block,
        )
        .unwrap();
        assert_eq!(folders.members("Inbox").unwrap(), vec![EmailId::new(10, 0)]);
    }
}
