//! Core of the backup-agent: the file model, content-addressed chunking,
//! and the local persistent state store.
//!
//! Networking (the HTTP/TLS client, the control-plane client, and the
//! upload-manager state machine) lives in `vessel-agent`, which depends on
//! this crate.

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
    deny(unused_imports, unused_mut, unused_variables)
)]

pub mod error;
pub mod file;
pub mod hash;
pub mod mime;
pub mod store;

pub use error::{VesselError, VesselResult};
pub use file::BackupFile;
pub use store::LocalStore;
