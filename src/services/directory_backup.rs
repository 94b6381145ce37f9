//! Resumable backup of whole directory trees.
//!
//! A run first finishes any uploads left pending by an interrupted run, then
//! walks the roots and backs up every regular file not yet processed. The
//! pending-upload queue is written out before every upload and periodically
//! in between. A run that completes removes the cache file; a run that fails
//! leaves it behind for the next invocation.

use crate::{
    errors::{BackupError, BackupResult},
    models::{FileSnapshot, PendingUpload, UploadQueue},
    services::{
        backup_client::BackupClient, digest, digest::DigestError, scratch::ScratchFile,
        transport::ObjectTransport,
    },
};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Files examined between two queue checkpoints.
const PERSIST_EVERY: usize = 25;

#[derive(Debug, Clone, Default)]
pub struct DirectoryBackupOptions {
    pub overwrite: bool,
    pub force_checksum: bool,
    /// Regexes matched against the start of each absolute file path.
    pub skip_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryBackupReport {
    /// Pending uploads from an earlier run that were completed.
    pub resumed: usize,
    /// Files run through the single-file backup.
    pub examined: usize,
    /// Objects actually transmitted, resumed ones included.
    pub uploaded: usize,
    /// Paths passed over: symlinks, pattern matches, already processed,
    /// non-UTF-8, unreadable or vanished mid-walk.
    pub skipped: usize,
}

fn compile_skip_patterns(patterns: &[String]) -> BackupResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})")).map_err(|source| {
                BackupError::InvalidSkipPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })
        })
        .collect()
}

fn is_skipped(path: &Path, patterns: &[Regex]) -> bool {
    let path = path.to_string_lossy();
    patterns.iter().any(|re| re.is_match(&path))
}

impl<T: ObjectTransport> BackupClient<T> {
    /// Back up every regular file below `roots`.
    pub async fn directory_backup(
        &self,
        roots: &[PathBuf],
        options: &DirectoryBackupOptions,
    ) -> BackupResult<DirectoryBackupReport> {
        self.scoped(self.directory_backup_inner(roots, options))
            .await
    }

    async fn directory_backup_inner(
        &self,
        roots: &[PathBuf],
        options: &DirectoryBackupOptions,
    ) -> BackupResult<DirectoryBackupReport> {
        let patterns = compile_skip_patterns(&options.skip_patterns)?;
        let mut queue = UploadQueue::load(self.settings().cache_file_path()).await?;
        if queue.pending_len() > 0 || queue.processed_len() > 0 {
            info!(
                pending = queue.pending_len(),
                processed = queue.processed_len(),
                "resuming interrupted directory backup"
            );
        }

        let mut report = DirectoryBackupReport::default();
        let outcome = match self.resume_pending(&mut queue, &mut report).await {
            Ok(()) => {
                self.walk_roots(roots, options, &patterns, &mut queue, &mut report)
                    .await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                queue.clear().await?;
                info!(
                    resumed = report.resumed,
                    examined = report.examined,
                    uploaded = report.uploaded,
                    skipped = report.skipped,
                    "directory backup complete"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(persist_err) = queue.persist().await {
                    error!("failed to save pending-upload queue: {}", persist_err);
                }
                Err(err)
            }
        }
    }

    /// Finish uploads whose encrypted copy survived an earlier run.
    async fn resume_pending(
        &self,
        queue: &mut UploadQueue,
        report: &mut DirectoryBackupReport,
    ) -> BackupResult<()> {
        for pending in queue.pending() {
            if !self.pending_still_valid(&pending).await? {
                queue.discard(&pending.local_file);
                drop(ScratchFile::at(&pending.encrypted_file));
                queue.persist().await?;
                continue;
            }

            let uploaded = self.commit_upload(&pending).await?;
            if let Ok(metadata) = fs::metadata(&pending.local_file).await {
                let snapshot = FileSnapshot::from_metadata(&metadata)?;
                self.catalog()
                    .set_metadata_cache(pending.local_backup_file_id, snapshot)
                    .await?;
            }
            queue.complete(&pending.local_file);
            drop(ScratchFile::at(&pending.encrypted_file));
            queue.persist().await?;

            report.resumed += 1;
            if uploaded {
                report.uploaded += 1;
            }
        }
        Ok(())
    }

    /// A pending upload can be committed only if its encrypted copy is intact,
    /// the source still has the content that was encrypted, and the catalog
    /// entry it belongs to still exists.
    async fn pending_still_valid(&self, pending: &PendingUpload) -> BackupResult<bool> {
        let encrypted = Path::new(&pending.encrypted_file);
        match digest::file_md5(encrypted).await {
            Ok(found) if found == pending.encrypted_file_md5 => {}
            Ok(_) => {
                warn!(path = %pending.local_file, "encrypted copy is damaged, dropping pending upload");
                return Ok(false);
            }
            Err(DigestError::NotFound(_)) => {
                warn!(path = %pending.local_file, "encrypted copy is gone, dropping pending upload");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        match digest::file_md5(Path::new(&pending.local_file)).await {
            Ok(found) if found == pending.local_file_md5 => {}
            Ok(_) | Err(DigestError::NotFound(_)) => {
                warn!(path = %pending.local_file, "file changed since it was encrypted, dropping pending upload");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        if self
            .catalog()
            .get_local(pending.local_backup_file_id)
            .await?
            .is_none()
        {
            warn!(
                path = %pending.local_file,
                id = pending.local_backup_file_id,
                "file entry no longer exists, dropping pending upload"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn walk_roots(
        &self,
        roots: &[PathBuf],
        options: &DirectoryBackupOptions,
        patterns: &[Regex],
        queue: &mut UploadQueue,
        report: &mut DirectoryBackupReport,
    ) -> BackupResult<()> {
        for root in roots {
            let root = std::path::absolute(root)?;
            info!(root = %root.display(), "backing up directory");

            let walker = WalkDir::new(&root).follow_links(false).sort_by_file_name();
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(error = %err, "skipping unreadable entry");
                        report.skipped += 1;
                        continue;
                    }
                };
                let file_type = entry.file_type();
                if file_type.is_symlink() {
                    debug!(path = %entry.path().display(), "skipping symlink");
                    report.skipped += 1;
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let Some(path) = entry.path().to_str() else {
                    warn!(path = %entry.path().display(), "skipping non UTF-8 path");
                    report.skipped += 1;
                    continue;
                };
                if is_skipped(entry.path(), patterns) || queue.is_processed(path) {
                    report.skipped += 1;
                    continue;
                }

                let uploaded = match self
                    .backup_path(
                        entry.path(),
                        options.overwrite,
                        options.force_checksum,
                        Some(&mut *queue),
                    )
                    .await
                {
                    Ok(uploaded) => uploaded,
                    // Files that vanish or change kind mid-walk are not fatal.
                    Err(err @ (BackupError::MissingFile(_) | BackupError::NotAFile(_))) => {
                        warn!(error = %err, "skipping file");
                        report.skipped += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                queue.mark_processed(path);
                report.examined += 1;
                if uploaded {
                    report.uploaded += 1;
                }
                if report.examined % PERSIST_EVERY == 0 {
                    queue.persist().await?;
                }
            }
        }
        Ok(())
    }
}
