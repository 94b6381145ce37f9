use crate::{
    models::upload_queue::QueueError,
    services::{
        catalog::CatalogError, crypto::CryptoError, digest::DigestError,
        transport::TransportError,
    },
};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors surfaced by the backup engine.
///
/// "Nothing to do" conditions are not errors; they come back as normal
/// results. Integrity failures are kept apart from transport failures since
/// they mean corrupted data rather than an unavailable store.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("storage transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("pending-upload queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("integrity check failed for {what}: expected {expected}, got {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("no crypto key configured")]
    MissingKey,

    #[error("file `{0}` does not exist")]
    MissingFile(PathBuf),

    #[error("`{0}` is not a regular file")]
    NotAFile(PathBuf),

    #[error("path `{path}` is outside the relative root `{root}`")]
    PathOutsideRoot { path: PathBuf, root: PathBuf },

    #[error("path `{0}` is not valid UTF-8")]
    NonUtf8Path(PathBuf),

    #[error("invalid skip pattern `{pattern}`: {source}")]
    InvalidSkipPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackupResult<T> = Result<T, BackupError>;

impl BackupError {
    pub fn integrity(
        what: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Integrity {
            what: what.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// True for failures that indicate corrupted data.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::Integrity { .. } | Self::Transport(TransportError::ChecksumMismatch { .. })
        )
    }
}
