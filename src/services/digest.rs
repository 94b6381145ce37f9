//! Content digests.
//!
//! One canonical text form is used end to end (catalog columns, transport
//! integrity checks, the pending-upload queue): the MD5 of the bytes, base64
//! encoded with the standard padded alphabet.

use base64::{Engine as _, engine::general_purpose};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};

/// Read size used when streaming a file through the digest.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("file `{0}` does not exist")]
    NotFound(PathBuf),
    #[error("file `{path}` could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Streaming digest accumulator.
pub struct ContentDigest {
    ctx: Context,
}

impl Default for ContentDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentDigest {
    pub fn new() -> Self {
        Self {
            ctx: Context::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.ctx.consume(bytes);
    }

    pub fn finish(self) -> String {
        general_purpose::STANDARD.encode(self.ctx.compute().0)
    }
}

/// Digest of an in-memory byte slice.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut digest = ContentDigest::new();
    digest.update(bytes);
    digest.finish()
}

/// Stream `path` through the digest and return its canonical encoding.
pub async fn file_md5(path: &Path) -> Result<String, DigestError> {
    let unreadable = |source: io::Error| {
        if source.kind() == ErrorKind::NotFound {
            DigestError::NotFound(path.to_path_buf())
        } else {
            DigestError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    };

    let mut file = File::open(path).await.map_err(unreadable)?;
    let mut digest = ContentDigest::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(unreadable)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(digest_bytes(b"foo"), "rL0Y20zC+Fzt72VPzMSk2A==");
        assert_eq!(digest_bytes(b"1234567890123456"), "q+rAfTwowb755zAALHU+1A==");
        assert_eq!(digest_bytes(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[tokio::test]
    async fn file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo");
        std::fs::write(&path, b"foo").unwrap();
        assert_eq!(file_md5(&path).await.unwrap(), "rL0Y20zC+Fzt72VPzMSk2A==");
    }

    #[tokio::test]
    async fn trailing_newline_changes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.txt");
        std::fs::write(&path, b"foo\n").unwrap();
        assert_eq!(file_md5(&path).await.unwrap(), "07BzhNET7exJ6qYjitX/AA==");
    }

    #[tokio::test]
    async fn large_file_streams_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        let data: Vec<u8> = (0..HASH_CHUNK_SIZE * 3 + 17).map(|i| i as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(file_md5(&path).await.unwrap(), digest_bytes(&data));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_md5(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, DigestError::NotFound(_)));
    }
}
