//! Row types persisted by [`super::LocalStore`].

use serde::{Deserialize, Serialize};

use crate::hash::{Sha1Digest, Sha256Digest};

/// A file record, keyed by path-identity (`path_hash`).
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path_hash: Sha1Digest,
    pub canonical_path: String,
    pub size: u64,
    pub mtime: i64,
    pub sha1: Option<Sha1Digest>,
    pub sha256: Option<Sha256Digest>,
    pub directory_id: i64,
    pub upload_id: Option<i64>,
    pub upload_key: Option<String>,
    pub last_backup: Option<i64>,
}

/// Terminal and in-flight states of an [`UploadRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    InProgress,
    Completed,
    Failed,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A local multipart-upload record.
///
/// `completed_parts` is persisted as a bitmap (see
/// [`super::bitmap::PartBitmap`]) but exposed here as a plain set for
/// callers.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub id: i64,
    pub file_hash: Sha1Digest,
    pub upload_key: String,
    pub completed_parts: Vec<u32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub state: UploadState,
}

impl UploadRecord {
    pub fn has_completed(&self, part: u32) -> bool {
        self.completed_parts.contains(&part)
    }
}

/// A remote object-storage provider, as reconciled from `heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub priority: i64,
    pub endpoint: String,
    #[serde(default)]
    pub credentials: String,
    pub enabled: bool,
}

/// The client's own enrollment identity, as stored in `settings`.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub deployment_key: Option<String>,
    pub client_token: Option<String>,
    pub user_id: Option<String>,
}

impl ClientIdentity {
    /// A valid client token must exist before any control-plane call other
    /// than `install_client` (§3 invariant).
    pub fn is_enrolled(&self) -> bool {
        self.client_token.is_some()
    }
}
