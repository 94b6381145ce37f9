//! Deduplicating, encrypting file backup.
//!
//! Local files are tracked in a SQLite catalog, encrypted with a pre-shared
//! key, and each distinct ciphertext is uploaded once to an object store.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use errors::{BackupError, BackupResult};
pub use services::{
    backup_client::{BackupClient, ClientSettings, RestoreOutcome},
    catalog::Catalog,
    crypto::CryptoKey,
    directory_backup::{DirectoryBackupOptions, DirectoryBackupReport},
    local_store::LocalObjectStore,
    transport::{GetOutcome, ObjectSummary, ObjectTransport},
};
