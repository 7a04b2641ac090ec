//! The email database engine.
//!
//! Layered over the raw block store, codec pipeline, and index trees,
//! this crate adds the database semantics: email batching with stable
//! compound ids, folder management, full-text search, supersession
//! tracking with an advisory transaction log, tamper-evidence hash
//! chaining, compaction, and format versioning. [`EmailDatabase`] is the
//! public entry point.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod errors;
pub use errors::{EngineError, EngineResult};

pub mod cancel;
pub use cancel::CancelToken;

pub mod email;
pub use email::ParsedEmail;

pub mod batch;
pub use batch::{AdaptiveBlockSizer, BatchReader, EmailBatchBuilder};

pub mod cache;

pub mod chain;
pub use chain::{HashChainManager, VerificationResult};

pub mod folders;
pub use folders::FolderManager;

pub mod maintenance;
pub use maintenance::{CompactionOutcome, MaintenanceManager};

pub mod search;
pub use search::Query;

pub mod supersede;
pub use supersede::SupersededBlockTracker;

pub mod txlog;
pub use txlog::{TxLog, TxTag};

pub mod version;
pub use version::VersionManager;

pub mod db;
pub use db::{
    BatchResult, DbStats, EmailDatabase, MigrationResult, SearchResult, INDEX_EMAILS,
    INDEX_ENVELOPE_HASH, INDEX_FOLDER, INDEX_MESSAGE_ID, INDEX_TERM,
};

// The shared option surface re-exported for embedders.
pub use emdb_types::{DatabaseOptions, DatabaseVersion, EmailId, Envelope, TargetBlockSize};
