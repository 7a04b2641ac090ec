//! Encryption backends.
//!
//! Both AEAD suites bind the ciphertext to the block identity through the
//! associated data `block_id ‖ type ‖ timestamp`, so a payload moved to a
//! different block id fails authentication instead of decrypting into
//! garbage. The CBC suite gets the same property from an encrypt-then-MAC
//! HMAC-SHA256 computed over `iv ‖ aad ‖ ciphertext`.

use crate::{CodecError, CodecResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use emdb_types::{BlockType, EncryptionAlgorithm};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Associated data binding a ciphertext to its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAad {
    /// Block id the payload belongs to.
    pub block_id: i64,
    /// Block type byte.
    pub block_type: BlockType,
    /// Creator timestamp.
    pub timestamp: i64,
}

impl BlockAad {
    /// Serializes to the canonical 17-byte AAD.
    pub fn to_bytes(self) -> [u8; 17] {
        let mut out = [0u8; 17];
        out[0..8].copy_from_slice(&self.block_id.to_be_bytes());
        out[8] = self.block_type as u8;
        out[9..17].copy_from_slice(&self.timestamp.to_be_bytes());
        out
    }
}

/// Output of [`encrypt`]: ciphertext plus the extended-header material.
#[derive(Debug, Clone)]
pub struct CipherText {
    /// Encrypted payload as stored on disk.
    pub ciphertext: Vec<u8>,
    /// IV, zero-padded to the 16-byte extended-header field.
    pub iv: [u8; 16],
    /// Detached authentication tag (16 bytes for AEAD, 32 for HMAC).
    pub auth_tag: Vec<u8>,
}

/// Encrypts `plaintext` under `key`, generating a fresh random IV.
pub fn encrypt(
    algo: EncryptionAlgorithm,
    key: &[u8],
    aad: BlockAad,
    plaintext: &[u8],
) -> CodecResult<CipherText> {
    if key.len() != algo.key_len() {
        return Err(CodecError::SerializationFailed(format!(
            "{algo:?} requires a {}-byte key, got {}",
            algo.key_len(),
            key.len()
        )));
    }

    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv[..algo.iv_len()]);
    let aad_bytes = aad.to_bytes();

    match algo {
        EncryptionAlgorithm::None => Err(CodecError::SerializationFailed(
            "encrypt called with algorithm None".into(),
        )),
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = aes_gcm::Aes256Gcm::new_from_slice(key)
                .map_err(|_| CodecError::AuthenticationFailed)?;
            let mut sealed = cipher
                .encrypt(
                    aes_gcm::Nonce::from_slice(&iv[..12]),
                    Payload { msg: plaintext, aad: &aad_bytes },
                )
                .map_err(|_| CodecError::AuthenticationFailed)?;
            let auth_tag = sealed.split_off(sealed.len() - 16);
            Ok(CipherText { ciphertext: sealed, iv, auth_tag })
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CodecError::AuthenticationFailed)?;
            let mut sealed = cipher
                .encrypt(
                    chacha20poly1305::Nonce::from_slice(&iv[..12]),
                    Payload { msg: plaintext, aad: &aad_bytes },
                )
                .map_err(|_| CodecError::AuthenticationFailed)?;
            let auth_tag = sealed.split_off(sealed.len() - 16);
            Ok(CipherText { ciphertext: sealed, iv, auth_tag })
        }
        EncryptionAlgorithm::Aes256CbcHmac => {
            use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
            let (enc_key, mac_key) = key.split_at(32);
            let enc_key: [u8; 32] = enc_key.try_into().expect("split at 32");
            let ciphertext = Aes256CbcEnc::new(&enc_key.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
            let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
                .map_err(|_| CodecError::AuthenticationFailed)?;
            mac.update(&iv);
            mac.update(&aad_bytes);
            mac.update(&ciphertext);
            let auth_tag = mac.finalize().into_bytes().to_vec();
            Ok(CipherText { ciphertext, iv, auth_tag })
        }
    }
}

/// Decrypts a payload read back from disk. Any mismatch in key, IV,
/// tag, or associated data fails [`CodecError::AuthenticationFailed`]; a
/// wrong key can never produce garbage plaintext.
pub fn decrypt(
    algo: EncryptionAlgorithm,
    key: &[u8],
    aad: BlockAad,
    ciphertext: &[u8],
    iv: &[u8; 16],
    auth_tag: &[u8],
) -> CodecResult<Vec<u8>> {
    if key.len() != algo.key_len() {
        return Err(CodecError::AuthenticationFailed);
    }
    let aad_bytes = aad.to_bytes();

    match algo {
        EncryptionAlgorithm::None => Err(CodecError::DeserializationFailed(
            "decrypt called with algorithm None".into(),
        )),
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = aes_gcm::Aes256Gcm::new_from_slice(key)
                .map_err(|_| CodecError::AuthenticationFailed)?;
            let mut sealed = ciphertext.to_vec();
            sealed.extend_from_slice(auth_tag);
            cipher
                .decrypt(
                    aes_gcm::Nonce::from_slice(&iv[..12]),
                    Payload { msg: &sealed, aad: &aad_bytes },
                )
                .map_err(|_| CodecError::AuthenticationFailed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CodecError::AuthenticationFailed)?;
            let mut sealed = ciphertext.to_vec();
            sealed.extend_from_slice(auth_tag);
            cipher
                .decrypt(
                    chacha20poly1305::Nonce::from_slice(&iv[..12]),
                    Payload { msg: &sealed, aad: &aad_bytes },
                )
                .map_err(|_| CodecError::AuthenticationFailed)
        }
        EncryptionAlgorithm::Aes256CbcHmac => {
            use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
            let (enc_key, mac_key) = key.split_at(32);
            let enc_key: [u8; 32] = enc_key.try_into().expect("split at 32");
            // Encrypt-then-MAC: verify before any decryption work.
            let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
                .map_err(|_| CodecError::AuthenticationFailed)?;
            mac.update(iv);
            mac.update(&aad_bytes);
            mac.update(ciphertext);
            mac.verify_slice(auth_tag).map_err(|_| CodecError::AuthenticationFailed)?;

            Aes256CbcDec::new(&enc_key.into(), &(*iv).into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CodecError::AuthenticationFailed)
        }
    }
}
