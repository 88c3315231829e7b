//! Per-file upload state machine.
//!
//! Drives a single [`BackupFile`] through init, part upload, and completion
//! against a [`ControlClient`], persisting progress in [`LocalStore`] after
//! every part so a restart resumes instead of re-uploading from scratch.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use vessel::store::models::UploadState;
use vessel::store::LocalStore;
use vessel::BackupFile;

use crate::control::ControlClient;
use crate::error::{AgentError, AgentResult};

/// Retry policy for a single part upload, per the exponential backoff plan:
/// base 1s, doubling, capped at 60s, at most 5 attempts.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 5;

/// Grace period after which a completed upload's bookkeeping row is
/// reaped from the store.
const DEFAULT_COMPLETION_GRACE_SECS: i64 = 300;

/// Adds up to 20% random jitter to a backoff delay, to avoid every worker
/// retrying a failed part in lockstep.
fn jitter(base: Duration) -> Duration {
    let extra_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 5).max(1));
    base + Duration::from_millis(extra_ms)
}

/// Drives one file's upload to completion (or failure), resuming from any
/// prior partial progress recorded in the store.
pub struct UploadManager<'a> {
    store: &'a LocalStore,
    control: &'a mut ControlClient,
}

impl<'a> UploadManager<'a> {
    pub fn new(store: &'a LocalStore, control: &'a mut ControlClient) -> Self {
        Self { store, control }
    }

    /// Uploads `file` end-to-end, returning once the file is either fully
    /// uploaded and marked `Completed`, or permanently `Failed`.
    ///
    /// Per §4.6's idempotence rule, a file whose size or mtime has drifted
    /// from the last-stored `FileRecord` invalidates any in-flight upload:
    /// the stale upload record is deleted and the sequence restarts from
    /// `init_upload`, rather than resuming with parts acknowledged against
    /// the old content.
    pub async fn upload(&mut self, file: &mut BackupFile, now: i64) -> AgentResult<()> {
        let path_hash = file.path_hash();

        let stored_record = self.store.get_file(path_hash)?;
        let file_changed = stored_record
            .as_ref()
            .map(|r| r.size != file.size() || r.mtime != file.mtime())
            .unwrap_or(false);

        let existing_upload = self.store.get_upload_for_file(path_hash)?;
        if file_changed {
            if let Some(stale) = &existing_upload {
                debug!(path = %file.canonical_path().display(), "file changed since last hash, invalidating upload");
                self.store.delete_upload(stale.id)?;
            }
        }

        self.store.put_file(&file.to_record())?;

        let carried_over = if file_changed { None } else { existing_upload };

        let mut upload = match carried_over {
            Some(existing) if existing.state == UploadState::Completed => {
                debug!(path = %file.canonical_path().display(), "already completed, skipping");
                return Ok(());
            }
            Some(existing) if existing.state == UploadState::Failed => {
                return Err(AgentError::Protocol(
                    "upload previously failed; clear the record or modify the file to retry".into(),
                ));
            }
            Some(existing) => existing,
            None => {
                let upload_key = self.control.init_upload(file).await?;
                let id = self.store.create_upload(path_hash, &upload_key, now)?;
                self.store.put_file(&file.to_record())?;
                self.store
                    .get_upload(id)?
                    .ok_or_else(|| AgentError::Protocol("upload record vanished after creation".into()))?
            }
        };

        file.set_upload_id(upload.id);
        file.set_upload_key(upload.upload_key.clone());

        let total_parts = file.total_parts();
        for part in 1..=total_parts {
            if upload.completed_parts.contains(&part) {
                continue;
            }

            match self.upload_part_with_retry(&upload.upload_key, file, part).await {
                Ok(()) => {
                    upload.completed_parts.push(part);
                    upload.updated_at = now;
                    self.store.put_upload(&upload)?;
                }
                Err(err) => {
                    warn!(part, %err, "part upload failed permanently");
                    upload.state = UploadState::Failed;
                    upload.updated_at = now;
                    self.store.put_upload(&upload)?;
                    return Err(err);
                }
            }
        }

        self.control.complete_upload(&upload.upload_key).await?;

        upload.state = UploadState::Completed;
        upload.updated_at = now;
        self.store.put_upload(&upload)?;
        file.update_last_backup(self.store, now)?;

        info!(path = %file.canonical_path().display(), parts = total_parts, "upload completed");
        Ok(())
    }

    async fn upload_part_with_retry(
        &mut self,
        upload_key: &str,
        file: &BackupFile,
        part: u32,
    ) -> AgentResult<()> {
        let mut attempt = 0u32;
        let mut delay = RETRY_BASE;

        loop {
            attempt += 1;
            match self.control.upload_file_part(upload_key, file, part).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retriable() && attempt < MAX_ATTEMPTS => {
                    let jittered = jitter(delay);
                    warn!(part, attempt, %err, delay_ms = jittered.as_millis() as u64, "retrying part upload after backoff");
                    sleep(jittered).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Deletes a `Completed` upload's bookkeeping row once it is older than the
/// grace period, keeping the `uploads` table from growing unbounded.
pub fn reap_completed_uploads(
    store: &LocalStore,
    now: i64,
    grace_period_secs: Option<i64>,
) -> AgentResult<u64> {
    let grace_period = grace_period_secs.unwrap_or(DEFAULT_COMPLETION_GRACE_SECS);
    Ok(store.reap_completed_uploads(now, grace_period)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel::store::LocalStore;

    fn test_store() -> LocalStore {
        LocalStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_jitter_stays_at_or_above_base() {
        let base = Duration::from_secs(1);
        for _ in 0..20 {
            let jittered = jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_millis(300));
        }
    }

    #[test]
    fn test_reap_completed_uploads_is_a_thin_wrapper() {
        let store = test_store();
        // No uploads exist yet; reaping an empty table removes nothing and
        // must not error.
        let reaped = reap_completed_uploads(&store, 1_000, Some(60)).unwrap();
        assert_eq!(reaped, 0);
    }
}
