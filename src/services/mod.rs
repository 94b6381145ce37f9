//! Backup engine services.
//!
//! Leaf-first: content digests and the crypto codec, the SQLite catalog, the
//! object-store transport and its filesystem implementation, and the
//! reconciliation engine built on top of them.

pub mod backup_client;
pub mod catalog;
pub mod crypto;
pub mod digest;
pub mod directory_backup;
pub mod local_store;
pub mod scratch;
pub mod transport;
