//! The compound email identifier.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable address of one email: the batch block that holds it and its
/// position within that batch. Assigned at append and never reassigned.
///
/// The canonical string form is `"batch_id:local_id"`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EmailId {
    /// `block_id` of the [`EmailBatch`](crate::BlockType::EmailBatch) block.
    pub batch_id: i64,
    /// 0-based index of the email within the batch.
    pub local_id: i32,
}

impl EmailId {
    /// Creates a new compound id.
    pub const fn new(batch_id: i64, local_id: i32) -> Self {
        Self { batch_id, local_id }
    }
}

impl core::fmt::Display for EmailId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.local_id)
    }
}

/// Failure to parse the `"batch_id:local_id"` string form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid email id `{input}`")]
pub struct ParseEmailIdError {
    /// The rejected input.
    pub input: String,
}

impl core::str::FromStr for EmailId {
    type Err = ParseEmailIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEmailIdError { input: s.to_owned() };
        let (batch, local) = s.split_once(':').ok_or_else(err)?;
        Ok(Self {
            batch_id: batch.parse().map_err(|_| err())?,
            local_id: local.parse().map_err(|_| err())?,
        })
    }
}
