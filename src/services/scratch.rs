//! Scoped temporary files in the work directory.

use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// A file path owned for the lifetime of the guard. The file, if it exists,
/// is removed when the guard is dropped unless [`ScratchFile::keep`] was
/// called.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    armed: bool,
}

impl ScratchFile {
    /// Reserve a fresh, uniquely named path inside `dir`. Nothing is created
    /// on disk until the caller writes to it.
    pub fn new_in(dir: &Path, suffix: &str) -> Self {
        Self::at(dir.join(format!("{}{}", Uuid::new_v4(), suffix)))
    }

    /// Take ownership of an existing path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the guard and hand the path to the caller.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove temp file {}: {}", self.path.display(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchFile::new_in(dir.path(), ".enc");
            std::fs::write(scratch.path(), b"x").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn never_written_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        drop(ScratchFile::new_in(dir.path(), ""));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn keep_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::new_in(dir.path(), ".enc");
        std::fs::write(scratch.path(), b"x").unwrap();
        let kept = scratch.keep();
        assert!(kept.exists());
        drop(ScratchFile::at(&kept));
        assert!(!kept.exists());
    }
}
