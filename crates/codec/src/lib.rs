//! Payload codec pipeline.
//!
//! Blocks are written serialize → compress → encrypt and read in reverse.
//! The header flags byte names both algorithms; the extended header
//! carries the uncompressed size, the IV, the authentication tag, and the
//! key generation. [`encode_block`]/[`decode_block`] are the only two
//! entry points the engine uses; everything else here is the machinery
//! behind them.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod errors;
pub use errors::{CodecError, CodecResult};

pub mod compression;
pub mod crypto;

pub mod encoding;
pub use encoding::{decode_content, encode_content};

pub mod keys;
pub use keys::KeyManager;

pub mod pipeline;
pub use pipeline::{decode_block, decode_block_raw, encode_block, CodecConfig};
