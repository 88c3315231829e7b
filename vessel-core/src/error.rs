//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type VesselResult<T> = Result<T, VesselError>;

/// An error produced by the core backup-agent library.
///
/// This only covers the kinds that originate below the network layer
/// (filesystem, local store, configuration). `vessel-agent` has its own
/// error type for HTTP/TLS/protocol/server failures and wraps this one.
#[derive(Debug, Display)]
pub enum VesselError {
    /// I/O error: {0}
    Io(io::Error),

    /// local store error: {0}
    Store(crate::store::StoreError),

    /// configuration error: {reason}
    Config { reason: String },
}

impl VesselError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Io(_) => "IoError",
            Self::Store(_) => "StoreError",
            Self::Config { .. } => "ConfigError",
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

impl StdError for VesselError {}

impl From<io::Error> for VesselError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<crate::store::StoreError> for VesselError {
    fn from(error: crate::store::StoreError) -> Self {
        Self::Store(error)
    }
}
