//! Streaming file encryption.
//!
//! Encrypted files are self-describing; only the key is needed to decrypt:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "BKTC"
//! 4       1     format version (1)
//! 5       3     reserved, zero
//! 8       8     plaintext length, u64 little endian
//! 16      16    AES-CBC initialization vector
//! 32      ...   ciphertext, plaintext length rounded up to 16 bytes
//! ```
//!
//! The final partial block is zero padded. The recorded plaintext length is
//! the only thing used to trim it on decryption. A fresh random IV is drawn
//! for every encryption, so the same plaintext never encrypts to the same
//! bytes twice.
//!
//! Nothing here authenticates the plaintext: a wrong key produces garbage
//! whose digest will not match, and callers must compare digests.

use crate::services::digest::ContentDigest;
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;

pub const BLOCK_SIZE: usize = 16;
pub const HEADER_LEN: usize = 32;
const MAGIC: &[u8; 4] = b"BKTC";
const FORMAT_VERSION: u8 = 1;
/// Streaming buffer size, a multiple of `BLOCK_SIZE`.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("crypto key must be 16, 24 or 32 bytes long, got {0}")]
    InvalidKeyLength(usize),
    #[error("could not read crypto key file `{path}`: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not open `{path}`: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encrypted input is truncated")]
    Truncated,
    #[error("encrypted input has an invalid header: {0}")]
    InvalidHeader(String),
    #[error("encrypted input has data past the recorded length")]
    TrailingData,
    #[error("input changed while encrypting: expected {expected} bytes, read {actual}")]
    SourceChanged { expected: u64, actual: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Pre-shared symmetric key. The key size picks AES-128/192/256.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> CryptoResult<Self> {
        let bytes = bytes.into();
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            n => Err(CryptoError::InvalidKeyLength(n)),
        }
    }

    /// Read a key from a file, ignoring surrounding whitespace.
    pub async fn from_file(path: &Path) -> CryptoResult<Self> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|source| CryptoError::KeyFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(raw.trim().as_bytes().to_vec())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Digests produced by [`encrypt_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptSummary {
    /// Digest of the plaintext.
    pub original_digest: String,
    /// Digest of the complete encrypted file, header included.
    pub encrypted_digest: String,
    pub plaintext_len: u64,
}

/// Digests produced by [`decrypt_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptSummary {
    /// Digest of the encrypted input as it was read.
    pub encrypted_digest: String,
    /// Digest of the recovered plaintext.
    pub decrypted_digest: String,
    pub plaintext_len: u64,
}

struct Header {
    plaintext_len: u64,
    iv: [u8; BLOCK_SIZE],
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4] = FORMAT_VERSION;
        out[8..16].copy_from_slice(&self.plaintext_len.to_le_bytes());
        out[16..].copy_from_slice(&self.iv);
        out
    }

    fn parse(raw: &[u8; HEADER_LEN]) -> CryptoResult<Self> {
        if &raw[..4] != MAGIC {
            return Err(CryptoError::InvalidHeader("bad magic".into()));
        }
        if raw[4] != FORMAT_VERSION {
            return Err(CryptoError::InvalidHeader(format!(
                "unsupported format version {}",
                raw[4]
            )));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&raw[8..16]);
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&raw[16..]);
        Ok(Self {
            plaintext_len: u64::from_le_bytes(len),
            iv,
        })
    }

    fn ciphertext_len(&self) -> CryptoResult<u64> {
        self.plaintext_len
            .checked_next_multiple_of(BLOCK_SIZE as u64)
            .ok_or_else(|| CryptoError::InvalidHeader("plaintext length overflows".into()))
    }
}

enum Encryptor {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

impl Encryptor {
    fn new(key: &CryptoKey, iv: &[u8; BLOCK_SIZE]) -> CryptoResult<Self> {
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());
        Ok(match key.len() {
            16 => Self::Aes128(cbc::Encryptor::new_from_slices(&key.0, iv).map_err(invalid)?),
            24 => Self::Aes192(cbc::Encryptor::new_from_slices(&key.0, iv).map_err(invalid)?),
            32 => Self::Aes256(cbc::Encryptor::new_from_slices(&key.0, iv).map_err(invalid)?),
            n => return Err(CryptoError::InvalidKeyLength(n)),
        })
    }

    /// `buf.len()` must be a multiple of `BLOCK_SIZE`.
    fn encrypt(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => encrypt_blocks(c, buf),
            Self::Aes192(c) => encrypt_blocks(c, buf),
            Self::Aes256(c) => encrypt_blocks(c, buf),
        }
    }
}

enum Decryptor {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl Decryptor {
    fn new(key: &CryptoKey, iv: &[u8; BLOCK_SIZE]) -> CryptoResult<Self> {
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());
        Ok(match key.len() {
            16 => Self::Aes128(cbc::Decryptor::new_from_slices(&key.0, iv).map_err(invalid)?),
            24 => Self::Aes192(cbc::Decryptor::new_from_slices(&key.0, iv).map_err(invalid)?),
            32 => Self::Aes256(cbc::Decryptor::new_from_slices(&key.0, iv).map_err(invalid)?),
            n => return Err(CryptoError::InvalidKeyLength(n)),
        })
    }

    /// `buf.len()` must be a multiple of `BLOCK_SIZE`.
    fn decrypt(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => decrypt_blocks(c, buf),
            Self::Aes192(c) => decrypt_blocks(c, buf),
            Self::Aes256(c) => decrypt_blocks(c, buf),
        }
    }
}

fn encrypt_blocks<C: BlockEncryptMut>(cipher: &mut C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks<C: BlockDecryptMut>(cipher: &mut C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn open_input(path: &Path) -> CryptoResult<File> {
    File::open(path).await.map_err(|source| CryptoError::Input {
        path: path.to_path_buf(),
        source,
    })
}

/// Encrypt `input` into `output`. A partially written output is removed on error.
pub async fn encrypt_file(
    input: &Path,
    output: &Path,
    key: &CryptoKey,
) -> CryptoResult<EncryptSummary> {
    let result = encrypt_inner(input, output, key).await;
    if result.is_err() {
        let _ = fs::remove_file(output).await;
    }
    result
}

async fn encrypt_inner(input: &Path, output: &Path, key: &CryptoKey) -> CryptoResult<EncryptSummary> {
    let mut reader = open_input(input).await?;
    let plaintext_len = reader.metadata().await?.len();
    let header = Header {
        plaintext_len,
        iv: rand::random(),
    };
    let mut cipher = Encryptor::new(key, &header.iv)?;

    let mut writer = File::create(output).await?;
    let header_bytes = header.to_bytes();
    let mut encrypted = ContentDigest::new();
    encrypted.update(&header_bytes);
    writer.write_all(&header_bytes).await?;

    let mut original = ContentDigest::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut seen: u64 = 0;
    loop {
        let n = read_full(&mut reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        original.update(&buf[..n]);
        seen += n as u64;

        let padded = n.next_multiple_of(BLOCK_SIZE);
        buf[n..padded].fill(0);
        cipher.encrypt(&mut buf[..padded]);
        encrypted.update(&buf[..padded]);
        writer.write_all(&buf[..padded]).await?;

        if n < CHUNK_SIZE {
            break;
        }
    }

    if seen != plaintext_len {
        return Err(CryptoError::SourceChanged {
            expected: plaintext_len,
            actual: seen,
        });
    }
    writer.flush().await?;
    writer.sync_all().await?;

    let summary = EncryptSummary {
        original_digest: original.finish(),
        encrypted_digest: encrypted.finish(),
        plaintext_len,
    };
    debug!(
        input = %input.display(),
        output = %output.display(),
        bytes = plaintext_len,
        original = %summary.original_digest,
        encrypted = %summary.encrypted_digest,
        "encrypted file"
    );
    Ok(summary)
}

/// Decrypt `input` into `output`. A partially written output is removed on error.
pub async fn decrypt_file(
    input: &Path,
    output: &Path,
    key: &CryptoKey,
) -> CryptoResult<DecryptSummary> {
    let result = decrypt_inner(input, output, key).await;
    if result.is_err() {
        let _ = fs::remove_file(output).await;
    }
    result
}

async fn decrypt_inner(input: &Path, output: &Path, key: &CryptoKey) -> CryptoResult<DecryptSummary> {
    let mut reader = open_input(input).await?;

    let mut header_bytes = [0u8; HEADER_LEN];
    if read_full(&mut reader, &mut header_bytes).await? < HEADER_LEN {
        return Err(CryptoError::Truncated);
    }
    let header = Header::parse(&header_bytes)?;
    let mut remaining_cipher = header.ciphertext_len()?;
    let mut remaining_plain = header.plaintext_len;
    let mut cipher = Decryptor::new(key, &header.iv)?;

    let mut encrypted = ContentDigest::new();
    encrypted.update(&header_bytes);
    let mut decrypted = ContentDigest::new();

    let mut writer = File::create(output).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining_cipher > 0 {
        let want = remaining_cipher.min(CHUNK_SIZE as u64) as usize;
        let n = read_full(&mut reader, &mut buf[..want]).await?;
        if n < want {
            return Err(CryptoError::Truncated);
        }
        encrypted.update(&buf[..n]);
        cipher.decrypt(&mut buf[..n]);

        let keep = remaining_plain.min(n as u64) as usize;
        decrypted.update(&buf[..keep]);
        writer.write_all(&buf[..keep]).await?;

        remaining_cipher -= n as u64;
        remaining_plain -= keep as u64;
    }

    let mut probe = [0u8; 1];
    if reader.read(&mut probe).await? != 0 {
        return Err(CryptoError::TrailingData);
    }
    writer.flush().await?;
    writer.sync_all().await?;

    let summary = DecryptSummary {
        encrypted_digest: encrypted.finish(),
        decrypted_digest: decrypted.finish(),
        plaintext_len: header.plaintext_len,
    };
    debug!(
        input = %input.display(),
        output = %output.display(),
        bytes = header.plaintext_len,
        "decrypted file"
    );
    Ok(summary)
}
