//! Core data models for the backup catalog.
//!
//! These entities map cleanly to catalog tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde` for CLI output.

pub mod backup_blob;
pub mod local_file;
pub mod upload_queue;

pub use backup_blob::BackupBlob;
pub use local_file::{FileSnapshot, LocalFileEntry};
pub use upload_queue::{PendingUpload, UploadQueue};
