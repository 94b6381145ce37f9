//! Represents a tracked path on the local filesystem.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{
    fs::Metadata,
    io,
    time::{SystemTime, UNIX_EPOCH},
};

/// One tracked local path.
///
/// `local_path` is stored relative to the configured relative root when one is
/// set, absolute otherwise.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct LocalFileEntry {
    /// Surrogate key.
    pub id: i64,

    /// Catalog path of the file. Unique.
    pub local_path: String,

    /// Blob holding the current content, if one has been associated yet.
    pub backup_blob_id: Option<i64>,

    /// Modification time (nanoseconds since the Unix epoch) at the last
    /// confirmed backup.
    pub cached_mtime: Option<i64>,

    /// File size in bytes at the last confirmed backup.
    pub cached_size: Option<i64>,
}

impl LocalFileEntry {
    /// True when the cached metadata matches `snapshot` exactly.
    ///
    /// An entry that was never cached is never unchanged.
    pub fn metadata_unchanged(&self, snapshot: &FileSnapshot) -> bool {
        match (self.cached_mtime, self.cached_size) {
            (Some(mtime), Some(size)) => mtime == snapshot.mtime && size == snapshot.size,
            _ => false,
        }
    }
}

/// The (mtime, size) pair of a file as observed on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSnapshot {
    pub mtime: i64,
    pub size: i64,
}

impl FileSnapshot {
    pub fn from_metadata(meta: &Metadata) -> io::Result<Self> {
        Ok(Self {
            mtime: epoch_nanos(meta.modified()?),
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
        })
    }
}

/// Signed nanoseconds relative to the Unix epoch, saturating at the i64 range.
fn epoch_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|nanos| -nanos)
            .unwrap_or(i64::MIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cached_mtime: Option<i64>, cached_size: Option<i64>) -> LocalFileEntry {
        LocalFileEntry {
            id: 1,
            local_path: "docs/a.txt".into(),
            backup_blob_id: Some(1),
            cached_mtime,
            cached_size,
        }
    }

    #[test]
    fn never_cached_is_changed() {
        let snapshot = FileSnapshot { mtime: 0, size: 0 };
        assert!(!entry(None, None).metadata_unchanged(&snapshot));
        assert!(!entry(None, Some(0)).metadata_unchanged(&snapshot));
    }

    #[test]
    fn exact_match_is_unchanged() {
        let snapshot = FileSnapshot { mtime: 42, size: 7 };
        assert!(entry(Some(42), Some(7)).metadata_unchanged(&snapshot));
        assert!(!entry(Some(43), Some(7)).metadata_unchanged(&snapshot));
        assert!(!entry(Some(42), Some(8)).metadata_unchanged(&snapshot));
    }

    #[test]
    fn pre_epoch_times_stay_distinct() {
        use std::time::Duration;

        let a = epoch_nanos(UNIX_EPOCH - Duration::from_secs(10));
        let b = epoch_nanos(UNIX_EPOCH - Duration::from_secs(20));
        assert_eq!(a, -10_000_000_000);
        assert_eq!(b, -20_000_000_000);
        assert_eq!(epoch_nanos(UNIX_EPOCH), 0);
        assert_eq!(epoch_nanos(UNIX_EPOCH + Duration::from_nanos(5)), 5);
    }
}
