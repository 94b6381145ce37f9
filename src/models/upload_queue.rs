//! Durable pending-upload queue for directory backups.
//!
//! A file enters the queue once its encrypted copy is complete and leaves it
//! once the remote PUT and the catalog update have both succeeded. The queue
//! and the set of already-processed paths are persisted as JSON so that an
//! interrupted run can be re-invoked and converge without re-encrypting or
//! re-uploading anything.
//!
//! On-disk layout:
//!
//! ```json
//! {
//!   "backup": {
//!     "pending_upload": {
//!       "/abs/path": {
//!         "local_file": "/abs/path",
//!         "local_file_md5": "...",
//!         "encrypted_file": "/work/dir/<uuid>.enc",
//!         "encrypted_file_md5": "...",
//!         "local_backup_file_id": 3,
//!         "object_path": "<uuid>"
//!       }
//!     },
//!     "processed": ["/abs/other"]
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Encryption result of a file whose upload has not been confirmed yet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingUpload {
    /// Absolute path of the plaintext file.
    pub local_file: String,

    /// Plaintext digest at encryption time.
    pub local_file_md5: String,

    /// Absolute path of the encrypted copy in the work directory.
    pub encrypted_file: String,

    /// Digest of the encrypted copy.
    pub encrypted_file_md5: String,

    /// Catalog id of the local file entry to attach the blob to.
    pub local_backup_file_id: i64,

    /// Remote object key reserved for this upload.
    pub object_path: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
struct BackupState {
    #[serde(default)]
    pending_upload: BTreeMap<String, PendingUpload>,
    #[serde(default)]
    processed: BTreeSet<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
struct CacheDocument {
    #[serde(default)]
    backup: BackupState,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cache file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache file `{path}` is not a valid pending-upload document: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Pending uploads plus the processed set, bound to their cache file.
#[derive(Debug)]
pub struct UploadQueue {
    path: PathBuf,
    state: BackupState,
}

impl UploadQueue {
    /// An empty queue that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: BackupState::default(),
        }
    }

    /// Load the queue from `path`. A missing file yields an empty queue.
    pub async fn load(path: impl Into<PathBuf>) -> QueueResult<Self> {
        let path = path.into();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::new(path)),
            Err(source) => return Err(QueueError::Io { path, source }),
        };
        let doc: CacheDocument = match serde_json::from_slice(&raw) {
            Ok(doc) => doc,
            Err(source) => return Err(QueueError::Corrupt { path, source }),
        };
        debug!(
            path = %path.display(),
            pending = doc.backup.pending_upload.len(),
            processed = doc.backup.processed.len(),
            "loaded upload queue"
        );
        Ok(Self {
            path,
            state: doc.backup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_processed(&self, local_file: &str) -> bool {
        self.state.processed.contains(local_file)
    }

    pub fn mark_processed(&mut self, local_file: impl Into<String>) {
        self.state.processed.insert(local_file.into());
    }

    pub fn processed_len(&self) -> usize {
        self.state.processed.len()
    }

    pub fn record_pending(&mut self, upload: PendingUpload) {
        self.state
            .pending_upload
            .insert(upload.local_file.clone(), upload);
    }

    /// Snapshot of the pending entries, in path order.
    pub fn pending(&self) -> Vec<PendingUpload> {
        self.state.pending_upload.values().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state.pending_upload.len()
    }

    /// Upload confirmed: drop the pending entry and mark the path processed.
    pub fn complete(&mut self, local_file: &str) {
        self.state.pending_upload.remove(local_file);
        self.state.processed.insert(local_file.to_string());
    }

    /// Forget a pending entry without marking it processed.
    pub fn discard(&mut self, local_file: &str) -> Option<PendingUpload> {
        self.state.pending_upload.remove(local_file)
    }

    /// Write the queue to its cache file (temp file + rename).
    pub async fn persist(&self) -> QueueResult<()> {
        let doc = CacheDocument {
            backup: self.state.clone(),
        };
        let body = serde_json::to_vec_pretty(&doc).map_err(|source| QueueError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &body).await.map_err(|e| self.io_err(e))?;
        if let Err(err) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.io_err(err));
        }
        debug!(
            path = %self.path.display(),
            pending = self.state.pending_upload.len(),
            processed = self.state.processed.len(),
            "persisted upload queue"
        );
        Ok(())
    }

    /// Reset to empty and remove the cache file.
    pub async fn clear(&mut self) -> QueueResult<()> {
        self.state = BackupState::default();
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_err(err)),
        }
    }

    fn io_err(&self, source: io::Error) -> QueueError {
        QueueError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
