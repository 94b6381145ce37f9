//! src/services/backup_client.rs
//!
//! BackupClient: reconciles tracked local files with the catalog and the
//! remote object store.
//!
//! Responsibilities:
//! - Decide per file whether an upload is needed (metadata cache, plaintext
//!   digest, dedup by original digest, overwrite policy)
//! - Encrypt into the work directory and upload each distinct ciphertext once
//! - Restore files with digest verification before anything is replaced
//! - Garbage-collect vanished entries and orphaned blobs

use crate::{
    errors::{BackupError, BackupResult},
    models::{BackupBlob, FileSnapshot, LocalFileEntry, PendingUpload, UploadQueue},
    services::{
        catalog::{Catalog, CatalogError, DuplicateGroups},
        crypto::{self, CryptoKey, DecryptSummary, EncryptSummary},
        digest,
        scratch::ScratchFile,
        transport::{GetOutcome, ObjectSummary, ObjectTransport, TransportError},
    },
};
use serde::Serialize;
use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{Dispatch, debug, info, instrument::WithSubscriber, warn};
use uuid::Uuid;

/// File name of the pending-upload cache inside the work directory.
pub const DEFAULT_CACHE_FILE_NAME: &str = "backup-cache.json";

/// Everything the engine needs to know about its environment.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub namespace: String,
    pub bucket: String,

    /// Prefix stripped from stored paths. Paths outside it are rejected.
    pub relative_root: Option<PathBuf>,

    /// Scratch space for encrypted copies and the pending-upload cache.
    pub work_dir: PathBuf,

    /// Explicit cache file; defaults to [`DEFAULT_CACHE_FILE_NAME`] in `work_dir`.
    pub cache_file: Option<PathBuf>,

    /// Needed by every operation that encrypts or decrypts.
    pub key: Option<CryptoKey>,
}

impl ClientSettings {
    pub fn cache_file_path(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join(DEFAULT_CACHE_FILE_NAME))
    }
}

/// Result of [`BackupClient::restore_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// The file was downloaded, decrypted, verified and moved into place.
    Restored,
    /// The local file already holds the backed-up content.
    AlreadyCurrent,
    /// No local file entry has the requested id.
    NotFound,
    /// The entry exists but was never associated with a blob.
    NoBackup,
    /// The object sits in an archive tier. Retry once the restore finishes.
    NotYetAvailable { restore_requested: bool },
}

impl RestoreOutcome {
    /// True when the destination now holds the backed-up content.
    pub fn succeeded(self) -> bool {
        matches!(self, Self::Restored | Self::AlreadyCurrent)
    }
}

/// The backup engine.
pub struct BackupClient<T> {
    settings: ClientSettings,
    catalog: Catalog,
    transport: T,
    dispatch: Option<Dispatch>,
}

impl<T: ObjectTransport> BackupClient<T> {
    /// Build a client, creating the work directory if needed.
    pub async fn new(
        mut settings: ClientSettings,
        catalog: Catalog,
        transport: T,
    ) -> BackupResult<Self> {
        settings.work_dir = std::path::absolute(&settings.work_dir)?;
        if let Some(root) = settings.relative_root.take() {
            settings.relative_root = Some(std::path::absolute(root)?);
        }
        fs::create_dir_all(&settings.work_dir).await?;
        debug!(
            namespace = %settings.namespace,
            bucket = %settings.bucket,
            work_dir = %settings.work_dir.display(),
            "backup client ready"
        );
        Ok(Self {
            settings,
            catalog,
            transport,
            dispatch: None,
        })
    }

    /// Route this client's log output to `dispatch` instead of the global
    /// default subscriber.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn key(&self) -> BackupResult<&CryptoKey> {
        self.settings.key.as_ref().ok_or(BackupError::MissingKey)
    }

    pub(crate) async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }

    /// Catalog form of an absolute path.
    pub(crate) fn catalog_path(&self, absolute: &Path) -> BackupResult<String> {
        let relative = match &self.settings.relative_root {
            Some(root) => absolute
                .strip_prefix(root)
                .map_err(|_| BackupError::PathOutsideRoot {
                    path: absolute.to_path_buf(),
                    root: root.clone(),
                })?,
            None => absolute,
        };
        relative
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| BackupError::NonUtf8Path(absolute.to_path_buf()))
    }

    /// Filesystem location of a catalog path.
    pub(crate) fn resolve_path(&self, local_path: &str) -> PathBuf {
        match &self.settings.relative_root {
            Some(root) => root.join(local_path),
            None => PathBuf::from(local_path),
        }
    }

    /// Back up one file. Returns true only when a new object was sent to
    /// storage.
    pub async fn backup_file(
        &self,
        path: &Path,
        overwrite: bool,
        force_checksum: bool,
    ) -> BackupResult<bool> {
        self.scoped(self.backup_path(path, overwrite, force_checksum, None))
            .await
    }

    /// Single-file state machine. With a queue, the encrypted copy is
    /// recorded as pending before the upload starts and left on disk if the
    /// upload fails, so a later run can resume it.
    pub(crate) async fn backup_path(
        &self,
        path: &Path,
        overwrite: bool,
        force_checksum: bool,
        mut queue: Option<&mut UploadQueue>,
    ) -> BackupResult<bool> {
        let key = self.key()?;
        let absolute = std::path::absolute(path)?;
        let metadata = match fs::metadata(&absolute).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(BackupError::NotAFile(absolute)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BackupError::MissingFile(absolute));
            }
            Err(err) => return Err(err.into()),
        };
        let queue_key = absolute
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| BackupError::NonUtf8Path(absolute.clone()))?;
        let local_path = self.catalog_path(&absolute)?;
        let snapshot = FileSnapshot::from_metadata(&metadata)?;

        let existing = self.catalog.find_local_by_path(&local_path).await?;
        if let Some(entry) = &existing {
            if !force_checksum
                && entry.backup_blob_id.is_some()
                && entry.metadata_unchanged(&snapshot)
            {
                debug!(path = %local_path, "metadata unchanged, skipping");
                mark_processed(&mut queue, &queue_key);
                return Ok(false);
            }
        }

        let plaintext_digest = digest::file_md5(&absolute).await?;
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let entry = self.catalog.insert_local(&local_path).await?;
                info!(id = entry.id, path = %local_path, "tracking new file");
                entry
            }
        };

        match entry.backup_blob_id {
            None => {
                if let Some(blob) = self.catalog.find_blob_by_original_digest(&plaintext_digest).await? {
                    self.catalog.set_backup_ref(entry.id, Some(blob.id)).await?;
                    self.catalog.set_metadata_cache(entry.id, snapshot).await?;
                    info!(path = %local_path, blob = blob.id, "content already backed up, attached existing blob");
                    mark_processed(&mut queue, &queue_key);
                    return Ok(false);
                }
            }
            Some(blob_id) => {
                let current = self
                    .catalog
                    .get_blob(blob_id)
                    .await?
                    .ok_or(CatalogError::BlobNotFound(blob_id))?;
                if current.original_digest == plaintext_digest {
                    debug!(path = %local_path, "content unchanged");
                    self.catalog.set_metadata_cache(entry.id, snapshot).await?;
                    mark_processed(&mut queue, &queue_key);
                    return Ok(false);
                }
                if let Some(blob) = self.catalog.find_blob_by_original_digest(&plaintext_digest).await? {
                    self.catalog.set_backup_ref(entry.id, Some(blob.id)).await?;
                    self.catalog.set_metadata_cache(entry.id, snapshot).await?;
                    info!(path = %local_path, blob = blob.id, "content matches an earlier backup, reattached");
                    mark_processed(&mut queue, &queue_key);
                    return Ok(false);
                }
                if !overwrite {
                    warn!(path = %local_path, "content changed but overwrite is disabled, keeping previous backup");
                    mark_processed(&mut queue, &queue_key);
                    return Ok(false);
                }
                info!(path = %local_path, previous = blob_id, "content changed, uploading new version");
                self.catalog.set_backup_ref(entry.id, None).await?;
            }
        }

        let encrypted = ScratchFile::new_in(&self.settings.work_dir, ".enc");
        let summary = crypto::encrypt_file(&absolute, encrypted.path(), key).await?;
        if summary.original_digest != plaintext_digest {
            warn!(path = %local_path, "file changed while being backed up, using the encrypted content's digest");
        }

        let pending = PendingUpload {
            local_file: queue_key,
            local_file_md5: summary.original_digest,
            encrypted_file: encrypted
                .path()
                .to_str()
                .map(str::to_string)
                .ok_or_else(|| BackupError::NonUtf8Path(encrypted.path().to_path_buf()))?,
            encrypted_file_md5: summary.encrypted_digest,
            local_backup_file_id: entry.id,
            object_path: self.generate_object_key().await?,
        };
        if let Some(queue) = queue.as_deref_mut() {
            queue.record_pending(pending.clone());
            queue.persist().await?;
        }

        match self.commit_upload(&pending).await {
            Ok(uploaded) => {
                if let Some(queue) = queue.as_deref_mut() {
                    queue.complete(&pending.local_file);
                }
                self.catalog.set_metadata_cache(entry.id, snapshot).await?;
                Ok(uploaded)
            }
            Err(err) => {
                if queue.is_some() {
                    let kept = encrypted.keep();
                    debug!(path = %kept.display(), "keeping encrypted copy for resume");
                }
                Err(err)
            }
        }
    }

    /// Make sure the ciphertext described by `pending` is stored remotely and
    /// attached to its local entry. Returns true if it was transmitted.
    pub(crate) async fn commit_upload(&self, pending: &PendingUpload) -> BackupResult<bool> {
        if let Some(blob) = self
            .catalog
            .find_blob_by_uploaded_digest(&pending.encrypted_file_md5)
            .await?
        {
            self.catalog
                .set_backup_ref(pending.local_backup_file_id, Some(blob.id))
                .await?;
            info!(path = %pending.local_file, blob = blob.id, "ciphertext already stored, attached existing blob");
            return Ok(false);
        }

        self.transport
            .put(
                &self.settings.namespace,
                &self.settings.bucket,
                &pending.object_path,
                Path::new(&pending.encrypted_file),
                &pending.encrypted_file_md5,
            )
            .await?;
        let blob = self
            .catalog
            .insert_blob_for_local(
                pending.local_backup_file_id,
                &pending.object_path,
                &pending.encrypted_file_md5,
                &pending.local_file_md5,
            )
            .await?;
        info!(
            path = %pending.local_file,
            key = %pending.object_path,
            blob = blob.id,
            "uploaded backup"
        );
        Ok(true)
    }

    /// A random object key not yet used by any blob.
    async fn generate_object_key(&self) -> BackupResult<String> {
        loop {
            let key = Uuid::new_v4().to_string();
            if self.catalog.find_blob_by_object_key(&key).await?.is_none() {
                return Ok(key);
            }
            debug!(key = %key, "object key collision, regenerating");
        }
    }

    /// Restore the file tracked as `local_id` from its backup.
    pub async fn restore_file(
        &self,
        local_id: i64,
        overwrite: bool,
        allow_archive_restore: bool,
    ) -> BackupResult<RestoreOutcome> {
        self.scoped(self.restore_inner(local_id, overwrite, allow_archive_restore))
            .await
    }

    async fn restore_inner(
        &self,
        local_id: i64,
        overwrite: bool,
        allow_archive_restore: bool,
    ) -> BackupResult<RestoreOutcome> {
        let key = self.key()?;
        let Some(entry) = self.catalog.get_local(local_id).await? else {
            warn!(id = local_id, "no local file entry with this id");
            return Ok(RestoreOutcome::NotFound);
        };
        let Some(blob_id) = entry.backup_blob_id else {
            warn!(id = local_id, path = %entry.local_path, "entry has no backup to restore");
            return Ok(RestoreOutcome::NoBackup);
        };
        let blob = self
            .catalog
            .get_blob(blob_id)
            .await?
            .ok_or(CatalogError::BlobNotFound(blob_id))?;
        let dest = self.resolve_path(&entry.local_path);

        if !overwrite && fs::try_exists(&dest).await? {
            let existing = digest::file_md5(&dest).await?;
            if existing == blob.original_digest {
                info!(path = %dest.display(), "local file already matches backup");
                return Ok(RestoreOutcome::AlreadyCurrent);
            }
        }

        let encrypted = ScratchFile::new_in(&self.settings.work_dir, ".enc");
        let outcome = self
            .transport
            .get(
                &self.settings.namespace,
                &self.settings.bucket,
                &blob.object_key,
                encrypted.path(),
                allow_archive_restore,
            )
            .await?;
        if let GetOutcome::NotRestored { restore_requested } = outcome {
            warn!(
                key = %blob.object_key,
                restore_requested,
                "object is archived and not yet available"
            );
            return Ok(RestoreOutcome::NotYetAvailable { restore_requested });
        }

        let downloaded = digest::file_md5(encrypted.path()).await?;
        if downloaded != blob.uploaded_digest {
            return Err(BackupError::integrity(
                format!("downloaded object `{}`", blob.object_key),
                blob.uploaded_digest,
                downloaded,
            ));
        }

        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).await?;
        let file_name = dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staged = ScratchFile::at(parent.join(format!(".{}.{}.restore", file_name, Uuid::new_v4())));

        let summary = crypto::decrypt_file(encrypted.path(), staged.path(), key).await?;
        if summary.encrypted_digest != blob.uploaded_digest {
            return Err(BackupError::integrity(
                format!("downloaded object `{}`", blob.object_key),
                blob.uploaded_digest,
                summary.encrypted_digest,
            ));
        }
        if summary.decrypted_digest != blob.original_digest {
            return Err(BackupError::integrity(
                format!("decrypted content of `{}`", entry.local_path),
                blob.original_digest,
                summary.decrypted_digest,
            ));
        }

        fs::rename(staged.path(), &dest).await?;
        staged.keep();
        info!(id = local_id, path = %dest.display(), "restored file");
        Ok(RestoreOutcome::Restored)
    }

    /// Drop entries whose file no longer exists. Returns the affected ids.
    pub async fn file_cleanup(&self, dry_run: bool) -> BackupResult<Vec<i64>> {
        self.scoped(self.file_cleanup_inner(dry_run)).await
    }

    async fn file_cleanup_inner(&self, dry_run: bool) -> BackupResult<Vec<i64>> {
        let mut removed = Vec::new();
        for entry in self.catalog.list_locals().await? {
            let path = self.resolve_path(&entry.local_path);
            if fs::try_exists(&path).await? {
                continue;
            }
            if dry_run {
                info!(id = entry.id, path = %entry.local_path, "would remove vanished file entry");
            } else {
                self.catalog.delete_local(entry.id).await?;
                info!(id = entry.id, path = %entry.local_path, "removed vanished file entry");
            }
            removed.push(entry.id);
        }
        Ok(removed)
    }

    /// Delete orphaned blobs, remote object first. Returns the affected ids.
    pub async fn backup_cleanup(&self, dry_run: bool) -> BackupResult<Vec<i64>> {
        self.scoped(self.backup_cleanup_inner(dry_run)).await
    }

    async fn backup_cleanup_inner(&self, dry_run: bool) -> BackupResult<Vec<i64>> {
        let mut removed = Vec::new();
        for id in self.catalog.orphan_blob_ids().await? {
            let blob = self
                .catalog
                .get_blob(id)
                .await?
                .ok_or(CatalogError::BlobNotFound(id))?;
            if dry_run {
                info!(id, key = %blob.object_key, "would remove orphaned backup");
                removed.push(id);
                continue;
            }
            match self
                .transport
                .delete(&self.settings.namespace, &self.settings.bucket, &blob.object_key)
                .await
            {
                Ok(()) => {}
                Err(TransportError::ObjectNotFound { .. }) => {
                    warn!(id, key = %blob.object_key, "remote object already gone");
                }
                Err(err) => return Err(err.into()),
            }
            self.catalog.delete_blob(id).await?;
            info!(id, key = %blob.object_key, "removed orphaned backup");
            removed.push(id);
        }
        Ok(removed)
    }

    /// Entries sharing a blob, groups of two or more only.
    pub async fn file_duplicates(&self) -> BackupResult<DuplicateGroups> {
        Ok(self.catalog.duplicates().await?)
    }

    pub async fn file_list(&self) -> BackupResult<Vec<LocalFileEntry>> {
        Ok(self.catalog.list_locals().await?)
    }

    pub async fn backup_list(&self) -> BackupResult<Vec<BackupBlob>> {
        Ok(self.catalog.list_blobs().await?)
    }

    pub async fn file_md5(&self, path: &Path) -> BackupResult<String> {
        Ok(digest::file_md5(path).await?)
    }

    /// Encrypt a file locally without uploading it.
    pub async fn file_encrypt(&self, input: &Path, output: &Path) -> BackupResult<EncryptSummary> {
        Ok(self
            .scoped(crypto::encrypt_file(input, output, self.key()?))
            .await?)
    }

    /// Decrypt a file produced by [`Self::file_encrypt`].
    pub async fn file_decrypt(&self, input: &Path, output: &Path) -> BackupResult<DecryptSummary> {
        Ok(self
            .scoped(crypto::decrypt_file(input, output, self.key()?))
            .await?)
    }

    /// Objects in the configured bucket.
    pub async fn object_list(&self) -> BackupResult<Vec<ObjectSummary>> {
        Ok(self
            .transport
            .list(&self.settings.namespace, &self.settings.bucket)
            .await?)
    }
}

fn mark_processed(queue: &mut Option<&mut UploadQueue>, local_file: &str) {
    if let Some(queue) = queue.as_deref_mut() {
        queue.mark_processed(local_file);
    }
}
