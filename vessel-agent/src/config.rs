//! Agent configuration.
//!
//! Settings are layered, in increasing precedence: compiled-in defaults, an
//! optional TOML file at `$XDG_CONFIG_HOME/vessel/config.toml`, then
//! environment variable overrides (`VESSEL_<SETTING_NAME>`, upper-cased).
//! The resolved [`Config`] is an immutable value passed explicitly into
//! constructors; there is no process-wide static state.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use displaydoc::Display;
use serde::Deserialize;
use xdg::BaseDirectories;

/// Application prefix in XDG base directories: `$XDG_CONFIG_HOME/vessel`.
const XDG_PREFIX: &str = "vessel";

const DEFAULT_CHUNK_SIZE: u64 = 52_428_800;
const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 52_428_800;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_STAT_INTERVAL_SECS: u64 = 300;
const DEFAULT_UPLOAD_FAILURE_GRACE_PERIOD_SECS: u64 = 86_400;

#[derive(Debug, Display)]
pub enum ConfigError {
    /// failed to read config file {path}: {source}
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// failed to parse config file {path}: {source}
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// unknown configuration key: {0}
    UnknownKey(String),
    /// missing required configuration key: {0}
    MissingKey(&'static str),
    /// invalid value for {key}: {reason}
    InvalidValue { key: &'static str, reason: String },
}

impl std::error::Error for ConfigError {}

/// On-disk / environment representation. All fields optional; defaults and
/// required-field enforcement happen in [`Config::resolve`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigData {
    endpoint: Option<String>,
    deployment_key: Option<String>,
    chunk_size: Option<u64>,
    large_file_threshold: Option<u64>,
    connection_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    stat_interval: Option<u64>,
    verify_tls: Option<bool>,
    http_logging: Option<bool>,
    worker_count: Option<usize>,
    upload_failure_grace_period: Option<u64>,
}

/// The fully resolved, immutable configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub deployment_key: Option<String>,
    pub chunk_size: u64,
    pub large_file_threshold: u64,
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stat_interval: Duration,
    pub verify_tls: bool,
    pub http_logging: bool,
    pub worker_count: usize,
    pub upload_failure_grace_period: Duration,
}

const RECOGNIZED_KEYS: &[&str] = &[
    "endpoint",
    "deployment_key",
    "chunk_size",
    "large_file_threshold",
    "connection_timeout",
    "heartbeat_interval",
    "stat_interval",
    "verify_tls",
    "http_logging",
    "worker_count",
    "upload_failure_grace_period",
];

impl Config {
    /// Loads the XDG config file (if any), layers environment overrides on
    /// top, and resolves defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        let file_data = match &path {
            Some(path) if path.exists() => load_from_path(path)?,
            _ => ConfigData::default(),
        };
        let data = apply_env_overrides(file_data)?;
        Self::resolve(data)
    }

    /// Resolves a [`ConfigData`] (already layered) into validated defaults.
    fn resolve(data: ConfigData) -> Result<Self, ConfigError> {
        let endpoint = data.endpoint.ok_or(ConfigError::MissingKey("endpoint"))?;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "endpoint",
                reason: "must start with http:// or https://".to_string(),
            });
        }

        Ok(Self {
            endpoint,
            deployment_key: data.deployment_key,
            chunk_size: data.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            large_file_threshold: data
                .large_file_threshold
                .unwrap_or(DEFAULT_LARGE_FILE_THRESHOLD),
            connection_timeout: Duration::from_secs(
                data.connection_timeout
                    .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS),
            ),
            heartbeat_interval: Duration::from_secs(
                data.heartbeat_interval
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            ),
            stat_interval: Duration::from_secs(
                data.stat_interval.unwrap_or(DEFAULT_STAT_INTERVAL_SECS),
            ),
            verify_tls: data.verify_tls.unwrap_or(true),
            http_logging: data.http_logging.unwrap_or(false),
            worker_count: data.worker_count.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            }),
            upload_failure_grace_period: Duration::from_secs(
                data.upload_failure_grace_period
                    .unwrap_or(DEFAULT_UPLOAD_FAILURE_GRACE_PERIOD_SECS),
            ),
        })
    }
}

fn config_path() -> Option<PathBuf> {
    BaseDirectories::with_prefix(XDG_PREFIX)
        .ok()
        .and_then(|dirs| dirs.find_config_file("config.toml"))
}

fn load_from_path(path: &Path) -> Result<ConfigData, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let raw: toml::Value = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    reject_unknown_keys(&raw)?;

    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn reject_unknown_keys(raw: &toml::Value) -> Result<(), ConfigError> {
    let recognized: HashSet<&str> = RECOGNIZED_KEYS.iter().copied().collect();
    if let toml::Value::Table(table) = raw {
        for key in table.keys() {
            if !recognized.contains(key.as_str()) {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
        }
    }
    Ok(())
}

/// Applies `VESSEL_<SETTING_NAME>` environment overrides on top of a
/// loaded [`ConfigData`].
fn apply_env_overrides(mut data: ConfigData) -> Result<ConfigData, ConfigError> {
    macro_rules! override_string {
        ($field:ident, $env:literal) => {
            if let Ok(value) = std::env::var($env) {
                data.$field = Some(value);
            }
        };
    }
    macro_rules! override_parsed {
        ($field:ident, $env:literal, $key:literal) => {
            if let Ok(value) = std::env::var($env) {
                data.$field = Some(value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: $key,
                    reason: format!("could not parse {:?} from {}", value, $env),
                })?);
            }
        };
    }

    override_string!(endpoint, "VESSEL_ENDPOINT");
    override_string!(deployment_key, "VESSEL_DEPLOYMENT_KEY");
    override_parsed!(chunk_size, "VESSEL_CHUNK_SIZE", "chunk_size");
    override_parsed!(
        large_file_threshold,
        "VESSEL_LARGE_FILE_THRESHOLD",
        "large_file_threshold"
    );
    override_parsed!(
        connection_timeout,
        "VESSEL_CONNECTION_TIMEOUT",
        "connection_timeout"
    );
    override_parsed!(
        heartbeat_interval,
        "VESSEL_HEARTBEAT_INTERVAL",
        "heartbeat_interval"
    );
    override_parsed!(stat_interval, "VESSEL_STAT_INTERVAL", "stat_interval");
    override_parsed!(verify_tls, "VESSEL_VERIFY_TLS", "verify_tls");
    override_parsed!(http_logging, "VESSEL_HTTP_LOGGING", "http_logging");
    override_parsed!(worker_count, "VESSEL_WORKER_COUNT", "worker_count");
    override_parsed!(
        upload_failure_grace_period,
        "VESSEL_UPLOAD_FAILURE_GRACE_PERIOD",
        "upload_failure_grace_period"
    );

    Ok(data)
}
