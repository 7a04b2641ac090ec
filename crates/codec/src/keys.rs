//! Key management.
//!
//! The master key lives in memory only between `unlock` and `lock` and is
//! zeroized on lock, together with every derived key. Per-block data keys
//! are derived with HKDF-SHA256 over `block_id ‖ key_id`, so a key is
//! recomputable from the master key alone; the wrapped copies persisted
//! in KeyManager blocks exist for recovery tooling and never contain raw
//! key material.

use crate::{crypto::BlockAad, CodecError, CodecResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use emdb_types::{EncryptionAlgorithm, KeyManagerContent, WrappedKey};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, info};
use zeroize::Zeroizing;

const WRAP_INFO: &[u8] = b"emdb keywrap v1";

/// Derives, caches, wraps, and forgets per-block data keys.
#[derive(Debug, Default)]
pub struct KeyManager {
    state: Mutex<Option<Unlocked>>,
}

struct Unlocked {
    master: Zeroizing<[u8; 32]>,
    generation: u32,
    derived: HashMap<(i64, u32), Zeroizing<Vec<u8>>>,
    /// Wrapped keys produced since the last [`KeyManager::take_pending`].
    pending: Vec<WrappedKey>,
}

impl std::fmt::Debug for Unlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unlocked")
            .field("generation", &self.generation)
            .field("derived", &self.derived.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// A locked manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a master key is loaded.
    pub fn is_unlocked(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Loads the master key. `persisted` is the KeyManager block history,
    /// newest last; the current generation continues from it.
    pub fn unlock(&self, master_key: [u8; 32], persisted: &[KeyManagerContent]) {
        let generation = persisted.iter().map(|c| c.generation).max().unwrap_or(0);
        let mut state = self.state.lock();
        *state = Some(Unlocked {
            master: Zeroizing::new(master_key),
            generation,
            derived: HashMap::new(),
            pending: Vec::new(),
        });
        info!(target: "emdb::keys", generation, "key manager unlocked");
    }

    /// Zeroizes the master key and every derived key.
    pub fn lock(&self) {
        if self.state.lock().take().is_some() {
            info!(target: "emdb::keys", "key manager locked");
        }
    }

    /// Current key generation.
    pub fn generation(&self) -> CodecResult<u32> {
        Ok(self.state.lock().as_ref().ok_or(CodecError::NotUnlocked)?.generation)
    }

    /// Starts a new key generation. Existing blocks keep decrypting via
    /// their recorded `key_id`; new blocks derive under the new one.
    pub fn rotate(&self) -> CodecResult<u32> {
        let mut state = self.state.lock();
        let unlocked = state.as_mut().ok_or(CodecError::NotUnlocked)?;
        unlocked.generation += 1;
        debug!(target: "emdb::keys", generation = unlocked.generation, "rotated key generation");
        Ok(unlocked.generation)
    }

    /// Derives (and caches) the data key for a new block under the
    /// current generation. Returns the key and the `key_id` to record in
    /// the extended header.
    pub fn generate_block_key(
        &self,
        block_id: i64,
        algo: EncryptionAlgorithm,
    ) -> CodecResult<(Zeroizing<Vec<u8>>, u32)> {
        let mut state = self.state.lock();
        let unlocked = state.as_mut().ok_or(CodecError::NotUnlocked)?;
        let key_id = unlocked.generation;
        let key = unlocked.derive(block_id, key_id, algo.key_len());

        let wrapped = unlocked.wrap(block_id, key_id, &key)?;
        unlocked.pending.push(wrapped);
        unlocked.derived.insert((block_id, key_id), key.clone());
        Ok((key, key_id))
    }

    /// Rederives the data key a stored block was encrypted under.
    pub fn get_block_key(
        &self,
        block_id: i64,
        key_id: u32,
        algo: EncryptionAlgorithm,
    ) -> CodecResult<Zeroizing<Vec<u8>>> {
        let mut state = self.state.lock();
        let unlocked = state.as_mut().ok_or(CodecError::NotUnlocked)?;
        if let Some(key) = unlocked.derived.get(&(block_id, key_id)) {
            return Ok(key.clone());
        }
        let key = unlocked.derive(block_id, key_id, algo.key_len());
        unlocked.derived.insert((block_id, key_id), key.clone());
        Ok(key)
    }

    /// Drains the wrapped keys accumulated since the last call, packaged
    /// for persistence into a KeyManager block. Returns `None` when there
    /// is nothing new to persist.
    pub fn take_pending(&self) -> CodecResult<Option<KeyManagerContent>> {
        let mut state = self.state.lock();
        let unlocked = state.as_mut().ok_or(CodecError::NotUnlocked)?;
        if unlocked.pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(KeyManagerContent {
            generation: unlocked.generation,
            keys: std::mem::take(&mut unlocked.pending),
        }))
    }

    /// Unwraps a persisted key, verifying the master key actually wrapped
    /// it. Used by recovery tooling and by `unlock` verification.
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> CodecResult<Zeroizing<Vec<u8>>> {
        let state = self.state.lock();
        let unlocked = state.as_ref().ok_or(CodecError::NotUnlocked)?;
        unlocked.unwrap(wrapped)
    }
}

impl Unlocked {
    fn derive(&self, block_id: i64, key_id: u32, key_len: usize) -> Zeroizing<Vec<u8>> {
        let hk = Hkdf::<Sha256>::new(None, self.master.as_ref());
        let mut info = [0u8; 12];
        info[0..8].copy_from_slice(&block_id.to_be_bytes());
        info[8..12].copy_from_slice(&key_id.to_be_bytes());
        let mut okm = Zeroizing::new(vec![0u8; key_len]);
        hk.expand(&info, okm.as_mut()).expect("okm length is always valid for sha256");
        okm
    }

    fn wrap_cipher(&self, key_id: u32) -> aes_gcm::Aes256Gcm {
        let hk = Hkdf::<Sha256>::new(None, self.master.as_ref());
        let mut info = Vec::with_capacity(WRAP_INFO.len() + 4);
        info.extend_from_slice(WRAP_INFO);
        info.extend_from_slice(&key_id.to_be_bytes());
        let mut wrap_key = Zeroizing::new([0u8; 32]);
        hk.expand(&info, wrap_key.as_mut()).expect("okm length is always valid for sha256");
        aes_gcm::Aes256Gcm::new_from_slice(wrap_key.as_ref()).expect("32-byte key")
    }

    fn wrap(&self, block_id: i64, key_id: u32, key: &[u8]) -> CodecResult<WrappedKey> {
        let aad = BlockAad {
            block_id,
            block_type: emdb_types::BlockType::KeyManager,
            timestamp: 0,
        }
        .to_bytes();
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .wrap_cipher(key_id)
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), Payload { msg: key, aad: &aad })
            .map_err(|_| CodecError::AuthenticationFailed)?;
        let mut wrapped = nonce.to_vec();
        wrapped.extend_from_slice(&sealed);
        Ok(WrappedKey { block_id, key_id, wrapped })
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> CodecResult<Zeroizing<Vec<u8>>> {
        if wrapped.wrapped.len() < 12 + 16 {
            return Err(CodecError::WrongKey {
                block_id: wrapped.block_id,
                key_id: wrapped.key_id,
            });
        }
        let (nonce, sealed) = wrapped.wrapped.split_at(12);
        let aad = BlockAad {
            block_id: wrapped.block_id,
            block_type: emdb_types::BlockType::KeyManager,
            timestamp: 0,
        }
        .to_bytes();
        self.wrap_cipher(wrapped.key_id)
            .decrypt(aes_gcm::Nonce::from_slice(nonce), Payload { msg: sealed, aad: &aad })
            .map(Zeroizing::new)
            .map_err(|_| CodecError::WrongKey {
                block_id: wrapped.block_id,
                key_id: wrapped.key_id,
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MASTER: [u8; 32] = [0x42; 32];

    #[test]
    fn locked_manager_refuses_everything() {
        let km = KeyManager::new();
        assert!(!km.is_unlocked());
        assert_eq!(
            km.generate_block_key(1, EncryptionAlgorithm::Aes256Gcm).unwrap_err(),
            CodecError::NotUnlocked
        );
        assert_eq!(
            km.get_block_key(1, 0, EncryptionAlgorithm::Aes256Gcm).unwrap_err(),
            CodecError::NotUnlocked
        );
    }

    #[test]
    fn derivation_is_deterministic_per_block_and_generation() {
        let km = KeyManager::new();
        km.unlock(MASTER, &[]);
        let (k1, id1) = km.generate_block_key(7, EncryptionAlgorithm::Aes256Gcm).unwrap();
        let k2 = km.get_block_key(7, id1, EncryptionAlgorithm::Aes256Gcm).unwrap();
        assert_eq!(k1.as_slice(), k2.as_slice());

        // Different block, different key.
        let (k3, _) = km.generate_block_key(8, EncryptionAlgorithm::Aes256Gcm).unwrap();
        assert_ne!(k1.as_slice(), k3.as_slice());
    }

    #[test]
    fn rederivable_after_lock_unlock() {
        let km = KeyManager::new();
        km.unlock(MASTER, &[]);
        let (k1, id1) = km.generate_block_key(7, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        km.lock();
        km.unlock(MASTER, &[]);
        let k2 = km.get_block_key(7, id1, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        assert_eq!(k1.as_slice(), k2.as_slice());
    }

    #[test]
    fn cbc_keys_are_64_bytes() {
        let km = KeyManager::new();
        km.unlock(MASTER, &[]);
        let (key, _) = km.generate_block_key(9, EncryptionAlgorithm::Aes256CbcHmac).unwrap();
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn rotation_changes_new_keys_but_not_old() {
        let km = KeyManager::new();
        km.unlock(MASTER, &[]);
        let (k_old, id_old) = km.generate_block_key(5, EncryptionAlgorithm::Aes256Gcm).unwrap();
        km.rotate().unwrap();
        let (k_new, id_new) = km.generate_block_key(5, EncryptionAlgorithm::Aes256Gcm).unwrap();
        assert_ne!(id_old, id_new);
        assert_ne!(k_old.as_slice(), k_new.as_slice());
        // Old generation still rederivable.
        let again = km.get_block_key(5, id_old, EncryptionAlgorithm::Aes256Gcm).unwrap();
        assert_eq!(again.as_slice(), k_old.as_slice());
    }

    #[test]
    fn wrapped_keys_roundtrip_and_reject_wrong_master() {
        let km = KeyManager::new();
        km.unlock(MASTER, &[]);
        let (key, _) = km.generate_block_key(11, EncryptionAlgorithm::Aes256Gcm).unwrap();
        let pending = km.take_pending().unwrap().expect("one wrapped key");
        assert_eq!(pending.keys.len(), 1);
        assert_eq!(km.unwrap_key(&pending.keys[0]).unwrap().as_slice(), key.as_slice());
        // Nothing left after draining.
        assert!(km.take_pending().unwrap().is_none());

        let other = KeyManager::new();
        other.unlock([0x13; 32], &[]);
        assert!(matches!(
            other.unwrap_key(&pending.keys[0]),
            Err(CodecError::WrongKey { block_id: 11, .. })
        ));
    }

    #[test]
    fn unlock_resumes_generation_from_history() {
        let km = KeyManager::new();
        km.unlock(MASTER, &[
            KeyManagerContent { generation: 2, keys: vec![] },
            KeyManagerContent { generation: 4, keys: vec![] },
        ]);
        assert_eq!(km.generation().unwrap(), 4);
    }
}
