//! Error taxonomy for snapshotting, catalog storage and reconciliation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::SourceKind;

/// Failures while invoking an external command.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
}

/// Failures reading or writing the catalog file.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog at {path} is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("catalog at {path} has unsupported version {found}")]
    UnsupportedVersion { path: PathBuf, found: u32 },

    #[error("catalog was modified concurrently ({attempts} attempts)")]
    WriteConflict { attempts: u32 },

    #[error("catalog I/O timed out after {0:?}")]
    TimedOut(Duration),

    #[error("catalog worker failed: {0}")]
    Worker(String),

    #[error("catalog write abandoned")]
    Abandoned,
}

/// Errors surfaced by the reconciliation engine and server operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} snapshot unavailable: {reason}")]
    SnapshotUnavailable { kind: SourceKind, reason: String },

    #[error("malformed aggregate record '{name}': {reason}")]
    MalformedAggregateRecord { name: String, reason: String },

    #[error("propagation of '{name}' failed: {reason}")]
    PropagationFailed { name: String, reason: String },

    #[error("event for '{name}' no longer applies: {reason}")]
    StaleEvent { name: String, reason: String },

    #[error("server '{0}' is not in the catalog")]
    UnknownServer(String),

    #[error("server '{0}' already exists in the catalog")]
    DuplicateServer(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl SyncError {
    /// True when the underlying failure was a concurrent catalog write that
    /// survived the retry.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, SyncError::Catalog(CatalogError::WriteConflict { .. }))
    }
}
