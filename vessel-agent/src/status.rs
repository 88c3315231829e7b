//! Periodic control-plane visibility: heartbeats and aggregated status.
//!
//! `AppManager` owns two independent timer loops — one per `heartbeat` and
//! one for an aggregated status push — each polling the shared shutdown
//! flag between ticks so the process exits promptly. Neither loop affects
//! upload correctness; they exist purely so the control plane can see that
//! the agent is alive and how much work it has done.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use vessel::store::LocalStore;

use crate::control::ControlClient;

/// Counters accumulated between status pushes, reset after each tick.
#[derive(Default)]
pub struct StatCounters {
    pub files_seen: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub errors: AtomicU64,
}

impl StatCounters {
    pub fn record_file_seen(&self) {
        self.files_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn take_snapshot(&self) -> (u64, u64, u64) {
        (
            self.files_seen.swap(0, Ordering::Relaxed),
            self.bytes_uploaded.swap(0, Ordering::Relaxed),
            self.errors.swap(0, Ordering::Relaxed),
        )
    }
}

/// Owns the two timer tasks and the shared counters they report from.
pub struct AppManager {
    tasks: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pub counters: Arc<StatCounters>,
}

impl AppManager {
    pub fn start(
        heartbeat_interval: Duration,
        stat_interval: Duration,
        store: LocalStore,
        control: Arc<tokio::sync::Mutex<ControlClient>>,
        process_start: std::time::Instant,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(StatCounters::default());

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            heartbeat_interval,
            store.clone(),
            control.clone(),
            shutdown.clone(),
            process_start,
        ));
        let stat_task = tokio::spawn(stat_loop(
            stat_interval,
            control,
            counters.clone(),
            shutdown.clone(),
        ));

        Self {
            tasks: vec![heartbeat_task, stat_task],
            shutdown,
            counters,
        }
    }

    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn heartbeat_loop(
    period: Duration,
    store: LocalStore,
    control: Arc<tokio::sync::Mutex<ControlClient>>,
    shutdown: Arc<AtomicBool>,
    process_start: std::time::Instant,
) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let uptime = process_start.elapsed().as_secs();
        let outcome = {
            let mut control = control.lock().await;
            control.heartbeat(uptime).await
        };

        match outcome {
            Ok(outcome) => {
                if let Err(err) = store.reconcile_providers(&outcome.providers) {
                    warn!(%err, "failed to reconcile providers from heartbeat");
                } else {
                    debug!(count = outcome.providers.len(), "reconciled providers");
                }
                if let Err(err) = store.set_setting("remote_settings", &outcome.settings.to_string()) {
                    warn!(%err, "failed to persist remote settings from heartbeat");
                }
            }
            Err(err) => warn!(%err, "heartbeat failed"),
        }
    }
}

async fn stat_loop(
    period: Duration,
    control: Arc<tokio::sync::Mutex<ControlClient>>,
    counters: Arc<StatCounters>,
    shutdown: Arc<AtomicBool>,
) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let (files_seen, bytes_uploaded, errors) = counters.take_snapshot();
        debug!(files_seen, bytes_uploaded, errors, "status tick");

        let mut control = control.lock().await;
        if let Err(err) = control.post_status(files_seen, bytes_uploaded, errors).await {
            warn!(%err, "status push failed");
        }
    }
}
