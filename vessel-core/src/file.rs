//! The [`BackupFile`] value object: a filesystem file plus derived identity.
//!
//! Per §9's redesign note, attribute refresh is an explicit construction
//! step rather than a side effect of mutating `set_path` — callers build a
//! new, immutable `BackupFile` instead of repointing an existing one.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::hash::{self, Sha1Digest, Sha256Digest};
use crate::store::{FileRecord, LocalStore, StoreError};

/// Default chunk size (50 MiB), per §3.
pub const DEFAULT_CHUNK_SIZE: u64 = 52_428_800;

/// Default large-file threshold (50 MiB), per §4.3.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 52_428_800;

/// Attributes refreshed from the filesystem (or from a stored record).
#[derive(Debug, Clone)]
struct FileAttrs {
    canonical_path: PathBuf,
    parent_path: PathBuf,
    file_name: String,
    extension: String,
    mime_type: String,
    size: u64,
    mtime: i64,
}

/// A filesystem file plus its derived path-identity and chunk plan.
///
/// Content hashes are computed lazily on first access and cached; per §3's
/// invariant, a cached hash is discarded if a later [`refresh`](Self::refresh)
/// detects the underlying size or mtime has drifted.
#[derive(Debug, Clone)]
pub struct BackupFile {
    attrs: FileAttrs,
    path_hash: Sha1Digest,
    directory_id: i64,
    chunk_size: u64,
    readable: bool,
    upload_id: Option<i64>,
    upload_key: Option<String>,
    sha1: Option<Sha1Digest>,
    sha256: Option<Sha256Digest>,
}

/// A byte range covered by one part, per §3's chunk plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part: u32,
    pub offset: u64,
    pub length: u64,
}

impl BackupFile {
    /// Builds a `BackupFile` from a path on disk, eagerly refreshing
    /// attributes (size, mtime, MIME lookup) but without touching content
    /// hashes.
    pub async fn from_path(
        store: &LocalStore,
        path: impl AsRef<Path>,
        directory_id: i64,
        chunk_size: u64,
    ) -> Result<Self, BackupFileError> {
        let canonical_path = tokio::fs::canonicalize(path.as_ref()).await?;
        let metadata = tokio::fs::metadata(&canonical_path).await?;
        let readable = File::open(&canonical_path).await.is_ok();

        let extension = canonical_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        let mime_type = store.lookup_mime(&extension)?;

        let file_name = canonical_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        let parent_path = canonical_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let path_hash = path_identity(&canonical_path);

        let attrs = FileAttrs {
            canonical_path,
            parent_path,
            file_name,
            extension,
            mime_type,
            size: metadata.len(),
            mtime,
        };

        Ok(Self {
            attrs,
            path_hash,
            directory_id,
            chunk_size,
            readable,
            upload_id: None,
            upload_key: None,
            sha1: None,
            sha256: None,
        })
    }

    /// Builds a `BackupFile` from a stored [`FileRecord`], without touching
    /// the filesystem.
    pub fn from_record(record: FileRecord, chunk_size: u64) -> Self {
        let canonical_path = PathBuf::from(&record.canonical_path);
        let extension = canonical_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        let file_name = canonical_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        let parent_path = canonical_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        Self {
            attrs: FileAttrs {
                canonical_path,
                parent_path,
                file_name,
                extension,
                // MIME type isn't persisted on the record; re-derive lazily
                // would require a store handle, so this constructor leaves
                // it blank until the caller refreshes from a path.
                mime_type: String::new(),
                size: record.size,
                mtime: record.mtime,
            },
            path_hash: record.path_hash,
            directory_id: record.directory_id,
            chunk_size,
            readable: false,
            upload_id: record.upload_id,
            upload_key: record.upload_key,
            sha1: record.sha1,
            sha256: record.sha256,
        }
    }

    pub fn path_hash(&self) -> Sha1Digest {
        self.path_hash
    }

    pub fn canonical_path(&self) -> &Path {
        &self.attrs.canonical_path
    }

    pub fn parent_path(&self) -> &Path {
        &self.attrs.parent_path
    }

    /// Path relative to `root`, or the canonical path if it isn't a prefix.
    pub fn relative_path(&self, root: &Path) -> PathBuf {
        self.attrs
            .canonical_path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.attrs.canonical_path.clone())
    }

    pub fn file_name(&self) -> &str {
        &self.attrs.file_name
    }

    pub fn extension(&self) -> &str {
        &self.attrs.extension
    }

    pub fn mime_type(&self) -> &str {
        &self.attrs.mime_type
    }

    pub fn size(&self) -> u64 {
        self.attrs.size
    }

    pub fn mtime(&self) -> i64 {
        self.attrs.mtime
    }

    pub fn directory_id(&self) -> i64 {
        self.directory_id
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn upload_id(&self) -> Option<i64> {
        self.upload_id
    }

    pub fn upload_key(&self) -> Option<&str> {
        self.upload_key.as_deref()
    }

    pub fn set_upload_id(&mut self, id: i64) {
        self.upload_id = Some(id);
    }

    pub fn set_upload_key(&mut self, key: String) {
        self.upload_key = Some(key);
    }

    /// Whether this file must go through the multipart path (§4.3).
    pub fn requires_multipart(&self, large_file_threshold: u64) -> bool {
        self.attrs.size > large_file_threshold
    }

    /// `⌈size / chunk_size⌉`, or `1` for a zero-byte file.
    pub fn total_parts(&self) -> u32 {
        if self.attrs.size == 0 {
            return 1;
        }
        self.attrs.size.div_ceil(self.chunk_size) as u32
    }

    /// The byte range for part `k` (1-indexed).
    pub fn part_range(&self, part: u32) -> PartRange {
        debug_assert!(part >= 1, "parts are 1-indexed");
        let offset = (part as u64 - 1) * self.chunk_size;
        let end = ((part as u64) * self.chunk_size).min(self.attrs.size);
        PartRange {
            part,
            offset,
            length: end.saturating_sub(offset),
        }
    }

    /// Reads up to `length` bytes starting at `offset`. Always hits disk;
    /// callers must not assume the file is fully resident in memory.
    pub async fn chunk(&self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.attrs.canonical_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; length as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let read = file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Returns `chunk((k-1)*chunk_size, chunk_size)`, with the last part
    /// possibly short.
    pub async fn part(&self, k: u32) -> io::Result<Vec<u8>> {
        let range = self.part_range(k);
        self.chunk(range.offset, range.length).await
    }

    /// Streaming SHA-1 over the full file content; cached after first call.
    pub async fn content_sha1(&mut self) -> io::Result<Sha1Digest> {
        if let Some(digest) = self.sha1 {
            return Ok(digest);
        }
        let digest = hash::sha1_file(&self.attrs.canonical_path).await?;
        self.sha1 = Some(digest);
        Ok(digest)
    }

    /// Streaming SHA-256 over the full file content; cached after first call.
    pub async fn content_sha256(&mut self) -> io::Result<Sha256Digest> {
        if let Some(digest) = self.sha256 {
            return Ok(digest);
        }
        let digest = hash::sha256_file(&self.attrs.canonical_path).await?;
        self.sha256 = Some(digest);
        Ok(digest)
    }

    /// Re-reads size and mtime from disk. If either has drifted from the
    /// values this instance was built with, cached content hashes are
    /// invalidated (§3 invariant).
    pub async fn refresh(&mut self) -> io::Result<()> {
        let metadata = tokio::fs::metadata(&self.attrs.canonical_path).await?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if metadata.len() != self.attrs.size || mtime != self.attrs.mtime {
            self.sha1 = None;
            self.sha256 = None;
            self.attrs.size = metadata.len();
            self.attrs.mtime = mtime;
        }

        Ok(())
    }

    /// Writes the current Unix timestamp as this file's last-backup time.
    pub fn update_last_backup(&self, store: &LocalStore, now: i64) -> Result<(), StoreError> {
        store.update_last_backup(self.path_hash, now)
    }

    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            path_hash: self.path_hash,
            canonical_path: self.attrs.canonical_path.to_string_lossy().into_owned(),
            size: self.attrs.size,
            mtime: self.attrs.mtime,
            sha1: self.sha1,
            sha256: self.sha256,
            directory_id: self.directory_id,
            upload_id: self.upload_id,
            upload_key: self.upload_key.clone(),
            last_backup: None,
        }
    }
}

/// SHA-1 of the canonical path's UTF-8 bytes (lossy for non-UTF-8 paths).
fn path_identity(canonical_path: &Path) -> Sha1Digest {
    hash::sha1_bytes(canonical_path.to_string_lossy().as_bytes())
}

/// Errors from constructing or refreshing a [`BackupFile`].
#[derive(Debug, displaydoc::Display)]
pub enum BackupFileError {
    /// I/O error: {0}
    Io(io::Error),
    /// local store error: {0}
    Store(StoreError),
}

impl std::error::Error for BackupFileError {}

impl From<io::Error> for BackupFileError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<StoreError> for BackupFileError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_zero_length_file_has_one_part() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.bin", b"").await;
        let store = LocalStore::open_in_memory().unwrap();

        let file = BackupFile::from_path(&store, &path, 1, DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();

        assert_eq!(file.total_parts(), 1);
        let part = file.part(1).await.unwrap();
        assert!(part.is_empty());
    }

    #[tokio::test]
    async fn test_small_file_one_part_exact_content() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0u8; 1024];
        let path = write_file(dir.path(), "small.bin", &data).await;
        let store = LocalStore::open_in_memory().unwrap();

        let mut file = BackupFile::from_path(&store, &path, 1, DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();

        assert_eq!(file.total_parts(), 1);
        let part = file.part(1).await.unwrap();
        assert_eq!(part, data);

        let digest = file.content_sha256().await.unwrap();
        assert_eq!(
            digest.to_hex(),
            "5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef"
        );
    }

    #[tokio::test]
    async fn test_multipart_exact_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_size = 100u64;
        let data = vec![1u8; 200];
        let path = write_file(dir.path(), "exact.bin", &data).await;
        let store = LocalStore::open_in_memory().unwrap();

        let file = BackupFile::from_path(&store, &path, 1, chunk_size).await.unwrap();
        assert_eq!(file.total_parts(), 2);

        let part1 = file.part(1).await.unwrap();
        let part2 = file.part(2).await.unwrap();
        assert_eq!(part1.len(), 100);
        assert_eq!(part2.len(), 100);

        let mut reconstructed = part1;
        reconstructed.extend(part2);
        assert_eq!(reconstructed, data);
    }

    #[tokio::test]
    async fn test_multipart_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_size = 100u64;
        let data = vec![2u8; 101];
        let path = write_file(dir.path(), "tail.bin", &data).await;
        let store = LocalStore::open_in_memory().unwrap();

        let file = BackupFile::from_path(&store, &path, 1, chunk_size).await.unwrap();
        assert_eq!(file.total_parts(), 2);

        let part2 = file.part(2).await.unwrap();
        assert_eq!(part2.len(), 1);
    }

    #[tokio::test]
    async fn test_path_hash_deterministic_for_same_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", b"hello").await;
        let store = LocalStore::open_in_memory().unwrap();

        let file1 = BackupFile::from_path(&store, &path, 1, DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();
        let file2 = BackupFile::from_path(&store, &path, 1, DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();

        assert_eq!(file1.path_hash(), file2.path_hash());
    }

    #[tokio::test]
    async fn test_unknown_extension_falls_back_to_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "weird.zzzzz", b"x").await;
        let store = LocalStore::open_in_memory().unwrap();

        let file = BackupFile::from_path(&store, &path, 1, DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(file.mime_type(), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_refresh_invalidates_cached_hash_on_size_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "grows.bin", b"v1").await;
        let store = LocalStore::open_in_memory().unwrap();

        let mut file = BackupFile::from_path(&store, &path, 1, DEFAULT_CHUNK_SIZE)
            .await
            .unwrap();
        let first_hash = file.content_sha256().await.unwrap();

        tokio::fs::write(&path, b"v1-longer-now").await.unwrap();
        file.refresh().await.unwrap();

        let second_hash = file.content_sha256().await.unwrap();
        assert_ne!(first_hash, second_hash);
    }
}
