//! Error handling for the networked half of the agent.
//!
//! This extends [`vessel::VesselError`] (filesystem/store/config) with the
//! network-facing kinds from §7: timeouts, TLS, malformed HTTP, and the
//! server/client HTTP status split.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type AgentResult<T> = Result<T, AgentError>;

/// An error from the networked half of the agent.
#[derive(Debug, Display)]
pub enum AgentError {
    /// I/O error: {0}
    Io(io::Error),

    /// operation timed out after {0:?}
    Timeout(std::time::Duration),

    /// TLS error: {0}
    Tls(String),

    /// malformed HTTP: {0}
    Protocol(String),

    /// server error (HTTP {status}): {message}
    Server { status: u16, message: String },

    /// client error (HTTP {status}): {message}
    Client { status: u16, message: String },

    /// local store error: {0}
    Store(vessel::store::StoreError),

    /// configuration error: {reason}
    Config { reason: String },
}

impl AgentError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether the upload manager should retry this error per §4.6: a
    /// timeout, a 5xx, or a 408/429.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Io(_) => true,
            Self::Server { .. } => true,
            Self::Client { status, .. } => *status == 408 || *status == 429,
            Self::Tls(_) | Self::Protocol(_) | Self::Store(_) | Self::Config { .. } => false,
        }
    }
}

impl StdError for AgentError {}

impl From<io::Error> for AgentError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<vessel::store::StoreError> for AgentError {
    fn from(error: vessel::store::StoreError) -> Self {
        Self::Store(error)
    }
}

impl From<vessel::VesselError> for AgentError {
    fn from(error: vessel::VesselError) -> Self {
        match error {
            vessel::VesselError::Io(e) => Self::Io(e),
            vessel::VesselError::Store(e) => Self::Store(e),
            vessel::VesselError::Config { reason } => Self::Config { reason },
        }
    }
}
