#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

mod config;
mod control;
mod error;
mod http;
mod scheduler;
mod status;
mod upload;

use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vessel::store::LocalStore;

use config::{Config, ConfigError};
use control::ControlClient;
use error::AgentError;
use http::HttpClient;
use scheduler::{Candidate, Scheduler};
use status::AppManager;

/// Exit codes, per the external interface contract: 0 success, 1 generic
/// error, 2 configuration error, 3 enrollment required, 4 no enabled
/// providers.
const EXIT_SUCCESS: u8 = 0;
const EXIT_GENERIC_ERROR: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_ENROLLMENT_REQUIRED: u8 = 3;
const EXIT_NO_PROVIDERS: u8 = 4;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vessel_agent=info".parse().unwrap()))
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let code = match run().await {
        Ok(()) => EXIT_SUCCESS,
        Err(RunError::Config(err)) => {
            error!(%err, "configuration error");
            EXIT_CONFIG_ERROR
        }
        Err(RunError::EnrollmentRequired) => {
            error!("client is not enrolled and no deployment key is configured");
            EXIT_ENROLLMENT_REQUIRED
        }
        Err(RunError::NoProviders) => {
            error!("no enabled storage providers are configured");
            EXIT_NO_PROVIDERS
        }
        Err(RunError::Agent(err)) => {
            error!(%err, "fatal error");
            EXIT_GENERIC_ERROR
        }
    };

    std::process::exit(code.into());
}

enum RunError {
    Config(ConfigError),
    EnrollmentRequired,
    NoProviders,
    Agent(AgentError),
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AgentError> for RunError {
    fn from(err: AgentError) -> Self {
        Self::Agent(err)
    }
}

async fn run() -> Result<(), RunError> {
    let config = Config::load()?;

    let data_dir = xdg::BaseDirectories::with_prefix("vessel")
        .ok()
        .and_then(|dirs| dirs.place_data_file("store.sqlite3").ok());
    let store = match data_dir {
        Some(path) => LocalStore::open(&path).map_err(AgentError::from)?,
        None => {
            warn!("no writable XDG data directory; falling back to an in-memory store");
            LocalStore::open_in_memory().map_err(AgentError::from)?
        }
    };

    ensure_enrolled(&config, &store).await?;

    let identity = store.get_client_identity().map_err(AgentError::from)?;
    let providers_present = store
        .highest_priority_enabled_provider()
        .map_err(AgentError::from)?;
    if providers_present.is_none() {
        // A fresh install has no providers until the first heartbeat; try
        // one synchronously before declaring failure.
        let outcome = run_initial_heartbeat(&config, identity.client_token.as_deref()).await?;
        if outcome.providers.is_empty() {
            return Err(RunError::NoProviders);
        }
        store
            .reconcile_providers(&outcome.providers)
            .map_err(AgentError::from)?;
        store
            .set_setting("remote_settings", &outcome.settings.to_string())
            .map_err(AgentError::from)?;
    }

    let control = build_control_client(&config, identity.client_token.clone())?;
    let control = std::sync::Arc::new(tokio::sync::Mutex::new(control));

    let process_start = Instant::now();
    let app_manager = AppManager::start(
        config.heartbeat_interval,
        config.stat_interval,
        store.clone(),
        control.clone(),
        process_start,
    );

    let scheduler = Scheduler::start(
        config.worker_count,
        config.endpoint.clone(),
        config.verify_tls,
        config.http_logging,
        config.connection_timeout,
        env!("CARGO_PKG_VERSION").to_string(),
        store.clone(),
        config.chunk_size,
    );

    feed_candidates_from_stdin(&scheduler).await;

    scheduler.shutdown().await;
    app_manager.shutdown().await;

    let now = unix_now();

    let failed_reaped = store
        .reap_stale_failed_uploads(now, config.upload_failure_grace_period.as_secs() as i64)
        .map_err(AgentError::from)
        .map_err(RunError::from)?;
    info!(reaped = failed_reaped, "reaped stale failed upload records");

    let completed_reaped = upload::reap_completed_uploads(&store, now, None).map_err(RunError::from)?;
    info!(reaped = completed_reaped, "reaped completed upload records");

    Ok(())
}

/// Enrolls the client if it isn't already, using the configured deployment
/// key. Idempotent against a server that reports the key as already
/// installed.
async fn ensure_enrolled(config: &Config, store: &LocalStore) -> Result<(), RunError> {
    let identity = store.get_client_identity().map_err(AgentError::from)?;
    if identity.is_enrolled() {
        return Ok(());
    }

    let deployment_key = config
        .deployment_key
        .as_deref()
        .ok_or(RunError::EnrollmentRequired)?;

    let http = HttpClient::new(&config.endpoint).map_err(RunError::from)?;
    let mut control = ControlClient::new(http, env!("CARGO_PKG_VERSION"));
    let hostname = hostname_or_unknown();
    let (client_token, user_id) = control
        .install_client(deployment_key, &hostname, std::env::consts::OS)
        .await
        .map_err(RunError::from)?;

    store
        .set_deployment_key(deployment_key)
        .map_err(AgentError::from)?;
    store
        .set_client_token(&client_token, &user_id)
        .map_err(AgentError::from)?;
    info!(%user_id, "enrolled client");
    Ok(())
}

async fn run_initial_heartbeat(
    config: &Config,
    client_token: Option<&str>,
) -> Result<control::HeartbeatOutcome, RunError> {
    let http = HttpClient::new(&config.endpoint).map_err(RunError::from)?;
    let mut control = ControlClient::new(http, env!("CARGO_PKG_VERSION"));
    control.refresh_client_token(client_token.map(str::to_string));
    let outcome = control.heartbeat(0).await.map_err(RunError::from)?;
    Ok(outcome)
}

fn build_control_client(config: &Config, client_token: Option<String>) -> Result<ControlClient, RunError> {
    let mut http = HttpClient::new(&config.endpoint).map_err(RunError::from)?;
    http.set_timeout(config.connection_timeout);
    http.set_verify_tls(config.verify_tls);
    http.set_http_logging(config.http_logging);
    let mut control = ControlClient::new(http, env!("CARGO_PKG_VERSION"));
    control.refresh_client_token(client_token);
    Ok(control)
}

/// Reads candidate file paths, one per line, from standard input until
/// EOF. The directory-walking iterator that produces these paths is an
/// external collaborator; this agent's only contract with it is the line
/// protocol.
async fn feed_candidates_from_stdin(scheduler: &Scheduler) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let path = line.trim();
                if path.is_empty() {
                    continue;
                }
                let candidate = Candidate {
                    path: path.into(),
                    directory_id: 0,
                };
                if scheduler.submit(candidate).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "failed to read candidate path from stdin");
                break;
            }
        }
    }
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
