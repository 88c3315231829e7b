//! The local persistent state store.
//!
//! Backed by a single SQLite file and a single shared connection, guarded
//! by a mutex — writes from concurrent workers are serialized through it
//! (§5: "LocalStore is process-wide and shared; a single connection with
//! serialized writes").

mod bitmap;
pub mod models;

use std::path::Path;
use std::sync::Arc;

use displaydoc::Display;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::hash::{Sha1Digest, Sha256Digest};
use crate::mime::{DEFAULT_MIME_TABLE, DEFAULT_MIME_TYPE};

pub use models::{ClientIdentity, FileRecord, ProviderRecord, UploadRecord, UploadState};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    path_hash   BLOB PRIMARY KEY,
    path        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    mtime       INTEGER NOT NULL,
    sha1        BLOB,
    sha256      BLOB,
    directory_id INTEGER NOT NULL,
    upload_id   INTEGER,
    upload_key  TEXT,
    last_backup INTEGER
);

CREATE TABLE IF NOT EXISTS uploads (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    file_hash               BLOB NOT NULL,
    upload_key              TEXT NOT NULL,
    completed_parts_bitmap  BLOB NOT NULL,
    created_at              INTEGER NOT NULL,
    updated_at              INTEGER NOT NULL,
    state                   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS providers (
    id          TEXT PRIMARY KEY,
    type        TEXT NOT NULL,
    priority    INTEGER NOT NULL,
    endpoint    TEXT NOT NULL,
    credentials TEXT NOT NULL,
    enabled     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mime (
    ext       TEXT PRIMARY KEY,
    mime_type TEXT NOT NULL
);
";

/// A local store failure: I/O, corruption, or a constraint violation.
#[derive(Debug, Display)]
pub enum StoreError {
    /// local store error: {0}
    Sqlite(rusqlite::Error),
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Sqlite(error)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The embedded local store.
///
/// Cheap to clone: internally an `Arc<Mutex<Connection>>`.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Opens (creating if absent) the store at `path`, running migrations
    /// and seeding the default MIME table if it is empty.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory store. Used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        store.seed_default_mime_table()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        let current = self
            .get_setting("schema_version")?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        if current < SCHEMA_VERSION {
            // No migrations beyond the base schema exist yet; bump the
            // recorded version so future upgrades have a starting point.
            self.set_setting("schema_version", &SCHEMA_VERSION.to_string())?;
        }

        Ok(())
    }

    // -- settings ---------------------------------------------------------

    pub fn get_setting(&self, name: &str) -> StoreResult<Option<String>> {
        let conn = self.inner.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, name: &str, value: &str) -> StoreResult<()> {
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }

    // -- client identity ----------------------------------------------------

    pub fn get_client_identity(&self) -> StoreResult<ClientIdentity> {
        Ok(ClientIdentity {
            deployment_key: self.get_setting("deployment_key")?,
            client_token: self.get_setting("client_token")?,
            user_id: self.get_setting("user_id")?,
        })
    }

    pub fn set_deployment_key(&self, key: &str) -> StoreResult<()> {
        self.set_setting("deployment_key", key)
    }

    pub fn set_client_token(&self, token: &str, user_id: &str) -> StoreResult<()> {
        self.set_setting("client_token", token)?;
        self.set_setting("user_id", user_id)
    }

    // -- files --------------------------------------------------------------

    pub fn get_file(&self, path_hash: Sha1Digest) -> StoreResult<Option<FileRecord>> {
        let conn = self.inner.lock();
        let record = conn
            .query_row(
                "SELECT path_hash, path, size, mtime, sha1, sha256, directory_id,
                        upload_id, upload_key, last_backup
                 FROM files WHERE path_hash = ?1",
                params![path_hash.as_bytes().to_vec()],
                row_to_file_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn put_file(&self, record: &FileRecord) -> StoreResult<()> {
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO files (path_hash, path, size, mtime, sha1, sha256, directory_id,
                                 upload_id, upload_key, last_backup)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(path_hash) DO UPDATE SET
                path = excluded.path,
                size = excluded.size,
                mtime = excluded.mtime,
                sha1 = excluded.sha1,
                sha256 = excluded.sha256,
                directory_id = excluded.directory_id,
                upload_id = excluded.upload_id,
                upload_key = excluded.upload_key,
                last_backup = excluded.last_backup",
            params![
                record.path_hash.as_bytes().to_vec(),
                record.canonical_path,
                record.size as i64,
                record.mtime,
                record.sha1.map(|h| h.as_bytes().to_vec()),
                record.sha256.map(|h| h.as_bytes().to_vec()),
                record.directory_id,
                record.upload_id,
                record.upload_key,
                record.last_backup,
            ],
        )?;
        Ok(())
    }

    pub fn update_last_backup(&self, path_hash: Sha1Digest, unix_ts: i64) -> StoreResult<()> {
        let conn = self.inner.lock();
        conn.execute(
            "UPDATE files SET last_backup = ?1 WHERE path_hash = ?2",
            params![unix_ts, path_hash.as_bytes().to_vec()],
        )?;
        Ok(())
    }

    // -- uploads --------------------------------------------------------------

    pub fn get_upload(&self, id: i64) -> StoreResult<Option<UploadRecord>> {
        let conn = self.inner.lock();
        let record = conn
            .query_row(
                "SELECT id, file_hash, upload_key, completed_parts_bitmap,
                        created_at, updated_at, state
                 FROM uploads WHERE id = ?1",
                params![id],
                row_to_upload_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Looks up the open (non-terminal) upload record for a file, if any.
    pub fn get_upload_for_file(&self, file_hash: Sha1Digest) -> StoreResult<Option<UploadRecord>> {
        let conn = self.inner.lock();
        let record = conn
            .query_row(
                "SELECT id, file_hash, upload_key, completed_parts_bitmap,
                        created_at, updated_at, state
                 FROM uploads WHERE file_hash = ?1 ORDER BY id DESC LIMIT 1",
                params![file_hash.as_bytes().to_vec()],
                row_to_upload_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Inserts a new upload record, returning its assigned local id.
    pub fn create_upload(
        &self,
        file_hash: Sha1Digest,
        upload_key: &str,
        now: i64,
    ) -> StoreResult<i64> {
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO uploads (file_hash, upload_key, completed_parts_bitmap,
                                   created_at, updated_at, state)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
            params![
                file_hash.as_bytes().to_vec(),
                upload_key,
                bitmap::encode(&[]),
                now,
                UploadState::InProgress.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn put_upload(&self, record: &UploadRecord) -> StoreResult<()> {
        let conn = self.inner.lock();
        conn.execute(
            "UPDATE uploads SET file_hash = ?1, upload_key = ?2, completed_parts_bitmap = ?3,
                                 updated_at = ?4, state = ?5
             WHERE id = ?6",
            params![
                record.file_hash.as_bytes().to_vec(),
                record.upload_key,
                bitmap::encode(&record.completed_parts),
                record.updated_at,
                record.state.as_str(),
                record.id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_upload(&self, id: i64) -> StoreResult<()> {
        let conn = self.inner.lock();
        conn.execute("DELETE FROM uploads WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Upload records in a terminal `Failed` state whose `updated_at` is
    /// older than `now - grace_period_secs` (§3 lifecycle: "reaped ...
    /// after a configurable grace period following failure").
    pub fn reap_stale_failed_uploads(&self, now: i64, grace_period_secs: i64) -> StoreResult<u64> {
        self.reap_stale_uploads_in_state(UploadState::Failed, now, grace_period_secs)
    }

    /// Upload records in the terminal `Completed` state whose `updated_at`
    /// is older than `now - grace_period_secs`. Called once a completed
    /// upload's bookkeeping is no longer needed to detect resumption.
    pub fn reap_completed_uploads(&self, now: i64, grace_period_secs: i64) -> StoreResult<u64> {
        self.reap_stale_uploads_in_state(UploadState::Completed, now, grace_period_secs)
    }

    fn reap_stale_uploads_in_state(
        &self,
        state: UploadState,
        now: i64,
        grace_period_secs: i64,
    ) -> StoreResult<u64> {
        let conn = self.inner.lock();
        let cutoff = now - grace_period_secs;
        let affected = conn.execute(
            "DELETE FROM uploads WHERE state = ?1 AND updated_at < ?2",
            params![state.as_str(), cutoff],
        )?;
        Ok(affected as u64)
    }

    // -- providers --------------------------------------------------------------

    /// Providers ordered by priority ascending, then id ascending.
    pub fn providers_by_priority(&self) -> StoreResult<Vec<ProviderRecord>> {
        let conn = self.inner.lock();
        let mut stmt = conn.prepare(
            "SELECT id, type, priority, endpoint, credentials, enabled
             FROM providers ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_provider_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn highest_priority_enabled_provider(&self) -> StoreResult<Option<ProviderRecord>> {
        Ok(self
            .providers_by_priority()?
            .into_iter()
            .find(|p| p.enabled))
    }

    pub fn upsert_provider(&self, provider: &ProviderRecord) -> StoreResult<()> {
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO providers (id, type, priority, endpoint, credentials, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                priority = excluded.priority,
                endpoint = excluded.endpoint,
                credentials = excluded.credentials,
                enabled = excluded.enabled",
            params![
                provider.id,
                provider.provider_type,
                provider.priority,
                provider.endpoint,
                provider.credentials,
                provider.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn delete_provider(&self, id: &str) -> StoreResult<()> {
        let conn = self.inner.lock();
        conn.execute("DELETE FROM providers WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Reconciles the local provider set against an authoritative list from
    /// `heartbeat`: upserts every entry, then deletes any local provider
    /// whose id is absent from `payload` (§4.5, §8 property 5).
    pub fn reconcile_providers(&self, payload: &[ProviderRecord]) -> StoreResult<()> {
        let conn = self.inner.lock();
        let tx = conn.unchecked_transaction()?;

        for provider in payload {
            tx.execute(
                "INSERT INTO providers (id, type, priority, endpoint, credentials, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    type = excluded.type,
                    priority = excluded.priority,
                    endpoint = excluded.endpoint,
                    credentials = excluded.credentials,
                    enabled = excluded.enabled",
                params![
                    provider.id,
                    provider.provider_type,
                    provider.priority,
                    provider.endpoint,
                    provider.credentials,
                    provider.enabled,
                ],
            )?;
        }

        let keep: Vec<&str> = payload.iter().map(|p| p.id.as_str()).collect();
        let placeholders = std::iter::repeat("?")
            .take(keep.len())
            .collect::<Vec<_>>()
            .join(",");
        if keep.is_empty() {
            tx.execute("DELETE FROM providers", [])?;
        } else {
            let query = format!("DELETE FROM providers WHERE id NOT IN ({placeholders})");
            let params: Vec<&dyn rusqlite::ToSql> =
                keep.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            tx.execute(&query, params.as_slice())?;
        }

        tx.commit()?;
        Ok(())
    }

    // -- mime -----------------------------------------------------------------

    fn seed_default_mime_table(&self) -> StoreResult<()> {
        let conn = self.inner.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM mime", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(());
        }

        for (ext, mime_type) in DEFAULT_MIME_TABLE {
            conn.execute(
                "INSERT OR IGNORE INTO mime (ext, mime_type) VALUES (?1, ?2)",
                params![ext, mime_type],
            )?;
        }
        Ok(())
    }

    /// Looks up a MIME type by extension (without the leading dot, matched
    /// case-insensitively). Unknown extensions resolve to
    /// [`DEFAULT_MIME_TYPE`], never an error.
    pub fn lookup_mime(&self, extension: &str) -> StoreResult<String> {
        let conn = self.inner.lock();
        let lowered = extension.to_ascii_lowercase();
        let found: Option<String> = conn
            .query_row(
                "SELECT mime_type FROM mime WHERE ext = ?1",
                params![lowered],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()))
    }
}

fn row_to_file_record(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    let path_hash: Vec<u8> = row.get(0)?;
    let sha1: Option<Vec<u8>> = row.get(4)?;
    let sha256: Option<Vec<u8>> = row.get(5)?;

    Ok(FileRecord {
        path_hash: Sha1Digest(to_array20(&path_hash)),
        canonical_path: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mtime: row.get(3)?,
        sha1: sha1.map(|b| Sha1Digest(to_array20(&b))),
        sha256: sha256.map(|b| Sha256Digest(to_array32(&b))),
        directory_id: row.get(6)?,
        upload_id: row.get(7)?,
        upload_key: row.get(8)?,
        last_backup: row.get(9)?,
    })
}

fn row_to_upload_record(row: &rusqlite::Row) -> rusqlite::Result<UploadRecord> {
    let file_hash: Vec<u8> = row.get(1)?;
    let bitmap_bytes: Vec<u8> = row.get(3)?;
    let state: String = row.get(6)?;

    Ok(UploadRecord {
        id: row.get(0)?,
        file_hash: Sha1Digest(to_array20(&file_hash)),
        upload_key: row.get(2)?,
        completed_parts: bitmap::decode(&bitmap_bytes),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        state: UploadState::from_str(&state).unwrap_or(UploadState::InProgress),
    })
}

fn row_to_provider_record(row: &rusqlite::Row) -> rusqlite::Result<ProviderRecord> {
    Ok(ProviderRecord {
        id: row.get(0)?,
        provider_type: row.get(1)?,
        priority: row.get(2)?,
        endpoint: row.get(3)?,
        credentials: row.get(4)?,
        enabled: row.get(5)?,
    })
}

fn to_array20(bytes: &[u8]) -> [u8; 20] {
    let mut array = [0u8; 20];
    let len = bytes.len().min(20);
    array[..len].copy_from_slice(&bytes[..len]);
    array
}

fn to_array32(bytes: &[u8]) -> [u8; 32] {
    let mut array = [0u8; 32];
    let len = bytes.len().min(32);
    array[..len].copy_from_slice(&bytes[..len]);
    array
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(path_hash: Sha1Digest, path: &str) -> FileRecord {
        FileRecord {
            path_hash,
            canonical_path: path.to_string(),
            size: 1024,
            mtime: 1_700_000_000,
            sha1: None,
            sha256: None,
            directory_id: 1,
            upload_id: None,
            upload_key: None,
            last_backup: None,
        }
    }

    #[test]
    fn test_setting_roundtrip() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.get_setting("chunk_size").unwrap(), None);

        store.set_setting("chunk_size", "52428800").unwrap();
        assert_eq!(
            store.get_setting("chunk_size").unwrap(),
            Some("52428800".to_string())
        );

        store.set_setting("chunk_size", "1024").unwrap();
        assert_eq!(store.get_setting("chunk_size").unwrap(), Some("1024".to_string()));
    }

    #[test]
    fn test_file_upsert() {
        let store = LocalStore::open_in_memory().unwrap();
        let hash = crate::hash::sha1_bytes(b"/var/backups/a.txt");
        let record = sample_file(hash, "/var/backups/a.txt");

        store.put_file(&record).unwrap();
        let fetched = store.get_file(hash).unwrap().unwrap();
        assert_eq!(fetched, record);

        let mut updated = record.clone();
        updated.size = 2048;
        store.put_file(&updated).unwrap();
        assert_eq!(store.get_file(hash).unwrap().unwrap().size, 2048);
    }

    #[test]
    fn test_update_last_backup() {
        let store = LocalStore::open_in_memory().unwrap();
        let hash = crate::hash::sha1_bytes(b"/var/backups/b.txt");
        store.put_file(&sample_file(hash, "/var/backups/b.txt")).unwrap();

        store.update_last_backup(hash, 1_700_000_500).unwrap();
        assert_eq!(
            store.get_file(hash).unwrap().unwrap().last_backup,
            Some(1_700_000_500)
        );
    }

    #[test]
    fn test_upload_lifecycle() {
        let store = LocalStore::open_in_memory().unwrap();
        let file_hash = crate::hash::sha1_bytes(b"/var/backups/c.bin");

        let id = store.create_upload(file_hash, "upload-key-1", 1000).unwrap();
        let record = store.get_upload(id).unwrap().unwrap();
        assert_eq!(record.state, UploadState::InProgress);
        assert!(record.completed_parts.is_empty());

        let mut updated = record.clone();
        updated.completed_parts.push(1);
        updated.updated_at = 1001;
        store.put_upload(&updated).unwrap();

        let refetched = store.get_upload(id).unwrap().unwrap();
        assert_eq!(refetched.completed_parts, vec![1]);
        assert!(refetched.has_completed(1));
        assert!(!refetched.has_completed(2));

        store.delete_upload(id).unwrap();
        assert!(store.get_upload(id).unwrap().is_none());
    }

    #[test]
    fn test_reap_stale_failed_uploads() {
        let store = LocalStore::open_in_memory().unwrap();
        let file_hash = crate::hash::sha1_bytes(b"/var/backups/d.bin");
        let id = store.create_upload(file_hash, "upload-key-2", 1000).unwrap();

        let mut record = store.get_upload(id).unwrap().unwrap();
        record.state = UploadState::Failed;
        record.updated_at = 1000;
        store.put_upload(&record).unwrap();

        // Not yet past the grace period.
        let reaped = store.reap_stale_failed_uploads(1000 + 99, 100).unwrap();
        assert_eq!(reaped, 0);
        assert!(store.get_upload(id).unwrap().is_some());

        // Past the grace period.
        let reaped = store.reap_stale_failed_uploads(1000 + 101, 100).unwrap();
        assert_eq!(reaped, 1);
        assert!(store.get_upload(id).unwrap().is_none());
    }

    #[test]
    fn test_reap_completed_uploads_leaves_in_progress_alone() {
        let store = LocalStore::open_in_memory().unwrap();
        let file_hash = crate::hash::sha1_bytes(b"/var/backups/e.bin");
        let id = store.create_upload(file_hash, "upload-key-3", 1000).unwrap();

        let mut record = store.get_upload(id).unwrap().unwrap();
        record.state = UploadState::Completed;
        record.updated_at = 1000;
        store.put_upload(&record).unwrap();

        let reaped = store.reap_completed_uploads(1000 + 101, 100).unwrap();
        assert_eq!(reaped, 1);
        assert!(store.get_upload(id).unwrap().is_none());

        let other_id = store.create_upload(file_hash, "upload-key-4", 1000).unwrap();
        let reaped = store.reap_completed_uploads(1000 + 101, 100).unwrap();
        assert_eq!(reaped, 0);
        assert!(store.get_upload(other_id).unwrap().is_some());
    }

    #[test]
    fn test_provider_priority_ordering() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .upsert_provider(&ProviderRecord {
                id: "p1".into(),
                provider_type: "s3".into(),
                priority: 10,
                endpoint: "https://p1".into(),
                credentials: String::new(),
                enabled: true,
            })
            .unwrap();
        store
            .upsert_provider(&ProviderRecord {
                id: "p2".into(),
                provider_type: "s3".into(),
                priority: 5,
                endpoint: "https://p2".into(),
                credentials: String::new(),
                enabled: true,
            })
            .unwrap();
        store
            .upsert_provider(&ProviderRecord {
                id: "p3".into(),
                provider_type: "azure".into(),
                priority: 1,
                endpoint: "https://p3".into(),
                credentials: String::new(),
                enabled: false,
            })
            .unwrap();

        let ordered = store.providers_by_priority().unwrap();
        assert_eq!(
            ordered.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["p3", "p2", "p1"]
        );

        // S5: highest-priority *enabled* provider is p2, not p3.
        let chosen = store.highest_priority_enabled_provider().unwrap().unwrap();
        assert_eq!(chosen.id, "p2");
    }

    #[test]
    fn test_provider_reconciliation() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .upsert_provider(&ProviderRecord {
                id: "A".into(),
                provider_type: "s3".into(),
                priority: 1,
                endpoint: "https://a-old".into(),
                credentials: String::new(),
                enabled: true,
            })
            .unwrap();
        store
            .upsert_provider(&ProviderRecord {
                id: "B".into(),
                provider_type: "s3".into(),
                priority: 2,
                endpoint: "https://b".into(),
                credentials: String::new(),
                enabled: true,
            })
            .unwrap();

        let payload = vec![
            ProviderRecord {
                id: "A".into(),
                provider_type: "s3".into(),
                priority: 1,
                endpoint: "https://a-new".into(),
                credentials: "creds".into(),
                enabled: true,
            },
            ProviderRecord {
                id: "C".into(),
                provider_type: "azure".into(),
                priority: 3,
                endpoint: "https://c".into(),
                credentials: String::new(),
                enabled: true,
            },
        ];
        store.reconcile_providers(&payload).unwrap();

        let ids: Vec<String> = store
            .providers_by_priority()
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["A", "C"]);

        let a = store
            .providers_by_priority()
            .unwrap()
            .into_iter()
            .find(|p| p.id == "A")
            .unwrap();
        assert_eq!(a.endpoint, "https://a-new");
    }

    #[test]
    fn test_mime_lookup_default_table_and_fallback() {
        let store = LocalStore::open_in_memory().unwrap();
        assert_eq!(store.lookup_mime("json").unwrap(), "application/json");
        assert_eq!(store.lookup_mime("JSON").unwrap(), "application/json");
        assert_eq!(
            store.lookup_mime("not-a-real-extension").unwrap(),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_client_identity() {
        let store = LocalStore::open_in_memory().unwrap();
        let identity = store.get_client_identity().unwrap();
        assert!(!identity.is_enrolled());

        store.set_deployment_key("dk-xyz").unwrap();
        store.set_client_token("tok-123", "user-1").unwrap();

        let identity = store.get_client_identity().unwrap();
        assert!(identity.is_enrolled());
        assert_eq!(identity.deployment_key.as_deref(), Some("dk-xyz"));
        assert_eq!(identity.client_token.as_deref(), Some("tok-123"));
        assert_eq!(identity.user_id.as_deref(), Some("user-1"));
    }
}
