//! src/services/local_store.rs
//!
//! LocalObjectStore: an object store kept on local disk, implementing
//! [`ObjectTransport`]. Payloads live beneath
//! `base_path/{namespace}/{bucket}/{shard}/{shard}/{key}`, each with a JSON
//! sidecar `{key}.meta.json` holding its digest, size, creation time and
//! storage class. Objects can be moved to an archive class, in which case
//! reads report "not restored" until the restore is completed.

use crate::services::{
    digest::ContentDigest,
    transport::{GetOutcome, ObjectSummary, ObjectTransport, TransportError, TransportResult},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const NAME_MIN_LEN: usize = 3;
const NAME_MAX_LEN: usize = 63;
const META_SUFFIX: &str = ".meta.json";
const TMP_PREFIX: &str = ".tmp-";

/// Storage tier of an object.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    Standard,
    Archive,
}

/// Sidecar metadata stored next to every payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object key within the bucket.
    pub key: String,

    /// Digest of the payload as received.
    pub md5: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// When the object was written.
    pub created: DateTime<Utc>,

    /// Current storage tier.
    pub storage_class: StorageClass,

    /// Whether a restore out of the archive tier has been requested.
    #[serde(default)]
    pub restore_requested: bool,
}

/// Filesystem-backed object store.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where namespaces are stored.
    pub base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject keys that could escape the bucket directory or collide with
    /// the store's own files.
    fn ensure_key_safe(&self, key: &str) -> TransportResult<()> {
        let invalid = || Err(TransportError::InvalidObjectKey(key.to_string()));
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return invalid();
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return invalid();
        }
        if key.ends_with(META_SUFFIX) || key.split('/').any(|part| part.starts_with(TMP_PREFIX)) {
            return invalid();
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return invalid();
        }
        Ok(())
    }

    /// Validate a namespace or bucket name.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_name_safe(&self, kind: &'static str, name: &str) -> TransportResult<()> {
        let invalid = |reason: &str| {
            Err(TransportError::InvalidName {
                kind,
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };

        let len = name.len();
        if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
            return invalid("must be between 3 and 63 characters");
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return invalid("must start and end with a lowercase letter or digit");
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return invalid("cannot contain consecutive dots or dot-hyphen combinations");
        }
        if is_ipv4_like(name) {
            return invalid("must not be formatted like an IP address");
        }
        Ok(())
    }

    fn ensure_location(&self, namespace: &str, bucket: &str, key: &str) -> TransportResult<()> {
        self.ensure_name_safe("namespace", namespace)?;
        self.ensure_name_safe("bucket", bucket)?;
        self.ensure_key_safe(key)
    }

    fn bucket_root(&self, namespace: &str, bucket: &str) -> PathBuf {
        self.base_path.join(namespace).join(bucket)
    }

    /// Two-level shard directories for a key: the first two bytes of
    /// MD5(bucket/key) in lowercase hex.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, namespace: &str, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(namespace, bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn meta_path(object_path: &Path) -> PathBuf {
        let mut raw = object_path.as_os_str().to_owned();
        raw.push(META_SUFFIX);
        PathBuf::from(raw)
    }

    async fn write_meta(path: &Path, meta: &ObjectMeta) -> TransportResult<()> {
        let body = serde_json::to_vec_pretty(meta)?;
        fs::write(path, body).await?;
        Ok(())
    }

    /// Fetch an object's sidecar metadata.
    pub async fn object_meta(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
    ) -> TransportResult<ObjectMeta> {
        self.ensure_location(namespace, bucket, key)?;
        let meta_path = Self::meta_path(&self.object_path(namespace, bucket, key));
        let raw = fs::read(&meta_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                TransportError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                TransportError::Io(err)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Stream-upload an object to disk.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes the digest and size while streaming.
    /// - Rejects the upload if `expected_md5` is given and does not match.
    /// - Atomically renames into the final location and writes the sidecar.
    ///
    /// Overwrites any existing object with the same key. Temp files are
    /// removed on every error path.
    pub async fn upload_object_stream<S>(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
        expected_md5: Option<&str>,
        stream: S,
    ) -> TransportResult<ObjectMeta>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_location(namespace, bucket, key)?;

        let file_path = self.object_path(namespace, bucket, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            TransportError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));

        let written = write_stream(&tmp_path, stream).await;
        let (size_bytes, md5) = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(TransportError::Io(err));
            }
        };

        if let Some(expected) = expected_md5 {
            if expected != md5 {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(TransportError::ChecksumMismatch {
                    key: key.to_string(),
                    expected: expected.to_string(),
                    actual: md5,
                });
            }
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransportError::Io(err));
        }

        let meta = ObjectMeta {
            key: key.to_string(),
            md5,
            size_bytes,
            created: Utc::now(),
            storage_class: StorageClass::Standard,
            restore_requested: false,
        };
        if let Err(err) = Self::write_meta(&Self::meta_path(&file_path), &meta).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }
        debug!(bucket, key, size = size_bytes, "stored object {}", file_path.display());
        Ok(meta)
    }

    /// Move an object into the archive tier.
    pub async fn archive(&self, namespace: &str, bucket: &str, key: &str) -> TransportResult<()> {
        let mut meta = self.object_meta(namespace, bucket, key).await?;
        meta.storage_class = StorageClass::Archive;
        meta.restore_requested = false;
        let meta_path = Self::meta_path(&self.object_path(namespace, bucket, key));
        Self::write_meta(&meta_path, &meta).await
    }

    /// Bring an archived object back to the standard tier.
    pub async fn complete_restore(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
    ) -> TransportResult<()> {
        let mut meta = self.object_meta(namespace, bucket, key).await?;
        meta.storage_class = StorageClass::Standard;
        meta.restore_requested = false;
        let meta_path = Self::meta_path(&self.object_path(namespace, bucket, key));
        Self::write_meta(&meta_path, &meta).await
    }

    /// Remove an object's payload and sidecar.
    ///
    /// Returns ObjectNotFound if the sidecar is missing; a missing payload
    /// alone is tolerated. Empty shard directories are pruned afterwards.
    pub async fn delete_object(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
    ) -> TransportResult<ObjectMeta> {
        let meta = self.object_meta(namespace, bucket, key).await?;
        let file_path = self.object_path(namespace, bucket, key);

        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
        fs::remove_file(Self::meta_path(&file_path)).await?;

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(namespace, bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(meta)
    }

    /// All objects in a bucket, sorted by key. A bucket that was never
    /// written to is empty.
    pub async fn list_objects(&self, namespace: &str, bucket: &str) -> TransportResult<Vec<ObjectMeta>> {
        self.ensure_name_safe("namespace", namespace)?;
        self.ensure_name_safe("bucket", bucket)?;

        let mut objects = Vec::new();
        let mut pending = vec![self.bucket_root(namespace, bucket)];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(TransportError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if entry.file_name().to_string_lossy().ends_with(META_SUFFIX) {
                    let raw = fs::read(entry.path()).await?;
                    objects.push(serde_json::from_slice::<ObjectMeta>(&raw)?);
                }
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Recursively remove empty directories up to the bucket root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Drain `stream` into a new file at `path`, returning its size and digest.
async fn write_stream<S>(path: &Path, stream: S) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = ContentDigest::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, digest.finish()))
}

impl ObjectTransport for LocalObjectStore {
    async fn put(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
        file: &Path,
        content_md5: &str,
    ) -> TransportResult<()> {
        let reader = File::open(file).await?;
        self.upload_object_stream(namespace, bucket, key, Some(content_md5), ReaderStream::new(reader))
            .await?;
        Ok(())
    }

    async fn get(
        &self,
        namespace: &str,
        bucket: &str,
        key: &str,
        dest: &Path,
        allow_archive_restore: bool,
    ) -> TransportResult<GetOutcome> {
        let mut meta = self.object_meta(namespace, bucket, key).await?;
        let file_path = self.object_path(namespace, bucket, key);

        if meta.storage_class == StorageClass::Archive {
            if allow_archive_restore && !meta.restore_requested {
                meta.restore_requested = true;
                Self::write_meta(&Self::meta_path(&file_path), &meta).await?;
                debug!(bucket, key, "requested restore of archived object");
            }
            return Ok(GetOutcome::NotRestored {
                restore_requested: meta.restore_requested,
            });
        }

        let reader = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                TransportError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                TransportError::Io(err)
            }
        })?;
        let (_, md5) = match write_stream(dest, ReaderStream::new(reader)).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(dest).await;
                return Err(TransportError::Io(err));
            }
        };
        if md5 != meta.md5 {
            let _ = fs::remove_file(dest).await;
            return Err(TransportError::ChecksumMismatch {
                key: key.to_string(),
                expected: meta.md5,
                actual: md5,
            });
        }
        Ok(GetOutcome::Downloaded)
    }

    async fn delete(&self, namespace: &str, bucket: &str, key: &str) -> TransportResult<()> {
        self.delete_object(namespace, bucket, key).await?;
        Ok(())
    }

    async fn list(&self, namespace: &str, bucket: &str) -> TransportResult<Vec<ObjectSummary>> {
        Ok(self
            .list_objects(namespace, bucket)
            .await?
            .into_iter()
            .map(|meta| ObjectSummary {
                key: meta.key,
                md5: meta.md5,
                size: meta.size_bytes,
                created: meta.created,
            })
            .collect())
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::digest::digest_bytes;

    const NS: &str = "citadel";
    const BUCKET: &str = "dragons";

    fn store() -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects"));
        (dir, store)
    }

    fn source(dir: &tempfile::TempDir, body: &[u8]) -> (PathBuf, String) {
        let path = dir.path().join(format!("src-{}", Uuid::new_v4()));
        std::fs::write(&path, body).unwrap();
        (path, digest_bytes(body))
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (dir, store) = store();
        let (src, md5) = source(&dir, b"payload bytes");
        store.put(NS, BUCKET, "obj-1", &src, &md5).await.unwrap();

        let dest = dir.path().join("dest");
        let outcome = store.get(NS, BUCKET, "obj-1", &dest, false).await.unwrap();
        assert_eq!(outcome, GetOutcome::Downloaded);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload bytes");

        let meta = store.object_meta(NS, BUCKET, "obj-1").await.unwrap();
        assert_eq!(meta.md5, md5);
        assert_eq!(meta.size_bytes, 13);
        assert_eq!(meta.storage_class, StorageClass::Standard);
    }

    #[tokio::test]
    async fn put_rejects_wrong_checksum() {
        let (dir, store) = store();
        let (src, _) = source(&dir, b"payload");
        let err = store
            .put(NS, BUCKET, "obj-1", &src, &digest_bytes(b"other"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChecksumMismatch { .. }));
        assert!(store.list(NS, BUCKET).await.unwrap().is_empty());

        // No temp files left behind in the shard directory.
        let shard_dir = store.object_path(NS, BUCKET, "obj-1");
        let leftovers = std::fs::read_dir(shard_dir.parent().unwrap())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn archived_objects_report_not_restored() {
        let (dir, store) = store();
        let (src, md5) = source(&dir, b"cold data");
        store.put(NS, BUCKET, "cold", &src, &md5).await.unwrap();
        store.archive(NS, BUCKET, "cold").await.unwrap();

        let dest = dir.path().join("dest");
        let outcome = store.get(NS, BUCKET, "cold", &dest, false).await.unwrap();
        assert_eq!(outcome, GetOutcome::NotRestored { restore_requested: false });

        let outcome = store.get(NS, BUCKET, "cold", &dest, true).await.unwrap();
        assert_eq!(outcome, GetOutcome::NotRestored { restore_requested: true });
        assert!(!dest.exists());

        store.complete_restore(NS, BUCKET, "cold").await.unwrap();
        let outcome = store.get(NS, BUCKET, "cold", &dest, false).await.unwrap();
        assert_eq!(outcome, GetOutcome::Downloaded);
        assert_eq!(std::fs::read(&dest).unwrap(), b"cold data");
    }

    #[tokio::test]
    async fn delete_prunes_and_reports_missing() {
        let (dir, store) = store();
        let (src, md5) = source(&dir, b"x");
        store.put(NS, BUCKET, "nested/obj", &src, &md5).await.unwrap();
        store.delete(NS, BUCKET, "nested/obj").await.unwrap();

        assert!(store.list(NS, BUCKET).await.unwrap().is_empty());
        let bucket_root = store.bucket_root(NS, BUCKET);
        assert_eq!(std::fs::read_dir(&bucket_root).unwrap().count(), 0);

        let err = store.delete(NS, BUCKET, "nested/obj").await.unwrap_err();
        assert!(matches!(err, TransportError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn list_is_sorted_and_skips_other_buckets() {
        let (dir, store) = store();
        for key in ["b", "a", "c/d"] {
            let (src, md5) = source(&dir, key.as_bytes());
            store.put(NS, BUCKET, key, &src, &md5).await.unwrap();
        }
        let (src, md5) = source(&dir, b"other");
        store.put(NS, "other-bucket", "z", &src, &md5).await.unwrap();

        let keys: Vec<_> = store
            .list(NS, BUCKET)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, ["a", "b", "c/d"]);
        assert!(store.list(NS, "never-used").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_unsafe_names() {
        let (dir, store) = store();
        let (src, md5) = source(&dir, b"x");
        for key in ["", "/abs", "../up", "a/../b", "x.meta.json", "a\\b"] {
            let err = store.put(NS, BUCKET, key, &src, &md5).await.unwrap_err();
            assert!(matches!(err, TransportError::InvalidObjectKey(_)), "{key}");
        }
        for bucket in ["ab", "Upper", "-dash", "a..b", "192.168.0.1"] {
            let err = store.put(NS, bucket, "k", &src, &md5).await.unwrap_err();
            assert!(matches!(err, TransportError::InvalidName { .. }), "{bucket}");
        }
    }
}
