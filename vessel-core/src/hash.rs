//! Streaming SHA-1 / SHA-256 hashing.
//!
//! The raw digest types are fixed-size byte arrays carried by copy — never
//! a shared pointer to a heap allocation — and are only ever rendered to
//! hex on demand, so a caller can't accidentally log a digest where a hex
//! string was expected or vice versa.

use std::path::Path;

use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Size of the read buffer used when streaming a file through a digest.
const STREAM_BLOCK_SIZE: usize = 64 * 1024;

/// A raw 20-byte SHA-1 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha1Digest(pub [u8; 20]);

/// A raw 32-byte SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Digest(pub [u8; 32]);

impl Sha1Digest {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl Sha256Digest {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Hashes a byte buffer with SHA-1.
pub fn sha1_bytes(data: &[u8]) -> Sha1Digest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Sha1Digest(hasher.finalize().into())
}

/// Hashes a byte buffer with SHA-256.
pub fn sha256_bytes(data: &[u8]) -> Sha256Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Sha256Digest(hasher.finalize().into())
}

/// Streams a file through SHA-1 in bounded-memory blocks.
pub async fn sha1_file(path: &Path) -> std::io::Result<Sha1Digest> {
    let mut hasher = Sha1::new();
    stream_into_digest(path, |chunk| hasher.update(chunk)).await?;
    Ok(Sha1Digest(hasher.finalize().into()))
}

/// Streams a file through SHA-256 in bounded-memory blocks.
pub async fn sha256_file(path: &Path) -> std::io::Result<Sha256Digest> {
    let mut hasher = Sha256::new();
    stream_into_digest(path, |chunk| hasher.update(chunk)).await?;
    Ok(Sha256Digest(hasher.finalize().into()))
}

async fn stream_into_digest(
    path: &Path,
    mut update: impl FnMut(&[u8]),
) -> std::io::Result<()> {
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; STREAM_BLOCK_SIZE];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        update(&buf[..read]);
    }

    Ok(())
}
