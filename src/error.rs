//! Core error taxonomy shared by the store, entries, endpoints and
//! clipboards.
//!
//! Every fallible core operation returns [`Error`]. The control plane
//! maps each variant to a machine-readable reason via [`Error::reason`].

use std::fmt;

/// The step of a storage operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStage {
    /// Opening or initializing the database / blob directory.
    Open,
    /// Compiling a SQL statement.
    Prepare,
    /// Executing a statement that does not return rows.
    Exec,
    /// Fetching rows from a query.
    Step,
    /// Reading, writing or deleting blob bytes.
    Io,
}

impl fmt::Display for StorageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageStage::Open => "open",
            StorageStage::Prepare => "prepare",
            StorageStage::Exec => "exec",
            StorageStage::Step => "step",
            StorageStage::Io => "io",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the synchronization and history engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed arguments (empty mime type, zero retention bound, ...).
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The content store failed; the enclosing transaction was rolled back.
    #[error("storage failed at {stage}: {detail}")]
    Storage { stage: StorageStage, detail: String },

    /// A requested entry, blob, clipboard or row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An endpoint transfer timed out or its transport broke.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Duplicate clipboard label or endpoint double-attach.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl Error {
    pub fn storage(stage: StorageStage, detail: impl fmt::Display) -> Self {
        Error::Storage {
            stage,
            detail: detail.to_string(),
        }
    }

    /// Wire-level reason string for control-plane responses.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Storage { .. } => "storage",
            Error::NotFound(_) => "not_found",
            Error::Transfer(_) => "transfer",
            Error::Conflict(_) => "conflict",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
