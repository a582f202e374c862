//! Error taxonomy for the restore pipeline.
//!
//! Variants mirror the taxonomy in the design doc section on error handling:
//! cryptographic/header failures are fatal, handler failures are recorded
//! per-VM and do not abort the run, dependency failures are fatal before any
//! write happens.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    /// Any HMAC or AEAD verification failure. Must never distinguish a
    /// wrong passphrase from tampered bytes.
    #[error("Wrong passphrase or tampered backup data")]
    BadPassphrase,

    #[error("Malformed archive header: {0}")]
    BadHeader(String),

    #[error("Unsupported archive format version {0}")]
    UnsupportedVersion(u32),

    #[error("Archive exceeded its resource quota ({0})")]
    QuotaExceeded(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source refused the restore request before sending any data: {0}")]
    RemoteRefused(String),

    #[error("Handler for `{path}` failed: {reason}")]
    HandlerFailed { path: String, reason: String },

    #[error("Restore plan cannot be satisfied: {0}")]
    DependencyMissing(String),

    #[error("Restore was cancelled")]
    Cancelled,

    #[error("Chunk sequence error in `{logical}`: {reason}")]
    ChunkSequence { logical: String, reason: String },

    #[error("Could not parse catalog (qubes.xml): {0}")]
    CatalogFormat(String),

    #[error("Cannot acquire restore lock at `{0}`")]
    LockHeld(PathBuf),
}

pub type Result<T> = std::result::Result<T, RestoreError>;
