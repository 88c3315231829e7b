//! Fixed worker-task pool that drains a queue of candidate file paths.
//!
//! Generalizes the channel-and-worker shape used for store-path pushing:
//! a bounded number of workers pull from a shared channel, each owning its
//! own [`HttpClient`]/[`ControlClient`] pair so connection state is never
//! shared between concurrent uploads (§5's "HttpClient is not shared
//! across workers").

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use vessel::store::LocalStore;
use vessel::BackupFile;

use crate::control::ControlClient;
use crate::http::HttpClient;
use crate::upload::UploadManager;

/// One file handed to a worker: its path and the directory grouping it
/// belongs to, mirroring how the file iterator assigns `directory_id`.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub directory_id: i64,
}

/// A handle to the running worker pool.
pub struct Scheduler {
    sender: mpsc::UnboundedSender<Candidate>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    /// Spawns `num_workers` worker tasks, each dialing `origin` independently.
    pub fn start(
        num_workers: usize,
        origin: String,
        verify_tls: bool,
        http_logging: bool,
        timeout: std::time::Duration,
        agent_version: String,
        store: LocalStore,
        chunk_size: u64,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers.max(1) {
            let receiver = receiver.clone();
            let store = store.clone();
            let origin = origin.clone();
            let agent_version = agent_version.clone();
            let shutdown = shutdown.clone();

            workers.push(tokio::spawn(async move {
                worker_loop(
                    id,
                    receiver,
                    store,
                    origin,
                    verify_tls,
                    http_logging,
                    timeout,
                    agent_version,
                    chunk_size,
                    shutdown,
                )
                .await;
            }));
        }

        Self {
            sender,
            workers,
            shutdown,
        }
    }

    /// Enqueues a candidate path for upload.
    pub fn submit(&self, candidate: Candidate) -> Result<(), Candidate> {
        self.sender.send(candidate.clone()).map_err(|_| candidate)
    }

    /// Signals all workers to stop after their current file, then waits
    /// for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        drop(self.sender);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(%err, "worker task panicked");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Candidate>>>,
    store: LocalStore,
    origin: String,
    verify_tls: bool,
    http_logging: bool,
    timeout: std::time::Duration,
    agent_version: String,
    chunk_size: u64,
    shutdown: Arc<AtomicBool>,
) {
    let http = match HttpClient::new(&origin) {
        Ok(mut http) => {
            http.set_timeout(timeout);
            http.set_verify_tls(verify_tls);
            http.set_http_logging(http_logging);
            http
        }
        Err(err) => {
            error!(worker = id, %err, "failed to construct HTTP client, worker exiting");
            return;
        }
    };
    let mut control = ControlClient::new(http, agent_version);
    if let Ok(identity) = store.get_client_identity() {
        control.refresh_client_token(identity.client_token);
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let candidate = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(candidate) = candidate else {
            break;
        };

        let now = unix_now();
        match BackupFile::from_path(&store, &candidate.path, candidate.directory_id, chunk_size).await {
            Ok(mut file) => {
                let mut manager = UploadManager::new(&store, &mut control);
                if let Err(err) = manager.upload(&mut file, now).await {
                    warn!(worker = id, path = %candidate.path.display(), %err, "upload failed");
                } else {
                    info!(worker = id, path = %candidate.path.display(), "upload succeeded");
                }
            }
            Err(err) => {
                warn!(worker = id, path = %candidate.path.display(), %err, "failed to stat candidate file");
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scheduler_submit_after_shutdown_fails_gracefully() {
        let store = LocalStore::open_in_memory().unwrap();
        let scheduler = Scheduler::start(
            1,
            "https://example.invalid".to_string(),
            true,
            false,
            std::time::Duration::from_secs(1),
            "test".to_string(),
            store,
            1024,
        );
        scheduler.shutdown().await;
    }
}
