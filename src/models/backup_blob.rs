//! Represents one uploaded encrypted object.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An encrypted object in remote storage, addressed by content.
///
/// Exactly one row exists per distinct encrypted digest. Any number of
/// [`LocalFileEntry`](super::LocalFileEntry) rows may point at the same blob.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct BackupBlob {
    /// Surrogate key.
    pub id: i64,

    /// Remote object key (a random UUID, unique in the catalog).
    pub object_key: String,

    /// Digest of the encrypted bytes as uploaded. Unique; the dedup key.
    pub uploaded_digest: String,

    /// Digest of the plaintext, checked after a restore.
    pub original_digest: String,
}
