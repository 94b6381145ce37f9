//! Remote object storage as seen by the backup engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{future::Future, io, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{kind} `{name}` invalid: {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("checksum mismatch for `{key}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("object metadata is unreadable: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Result of a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    /// The object was written to the destination file.
    Downloaded,
    /// The object sits in an archive tier and cannot be read yet.
    /// `restore_requested` tells whether a restore is now in progress.
    NotRestored { restore_requested: bool },
}

/// One entry of a bucket listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    /// Content digest recorded at upload, in the catalog's encoding.
    pub md5: String,
    pub size: i64,
    pub created: DateTime<Utc>,
}

/// Object-store operations the engine needs. Network timeouts and retries
/// belong to the implementation.
pub trait ObjectTransport: Send + Sync {
    /// Upload `file` as `key`. The store verifies `content_md5` against the
    /// bytes it received.
    fn put(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
        file: &Path,
        content_md5: &str,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    /// Download `key` into `dest`. Archived objects are reported, not failed;
    /// with `allow_archive_restore` a restore is requested first.
    fn get(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
        dest: &Path,
        allow_archive_restore: bool,
    ) -> impl Future<Output = TransportResult<GetOutcome>> + Send;

    fn delete(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    fn list(
        &self,
        namespace: &str,
        bucket: &str,
    ) -> impl Future<Output = TransportResult<Vec<ObjectSummary>>> + Send;
}
