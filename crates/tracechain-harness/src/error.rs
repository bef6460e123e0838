//! Harness error types.
//!
//! Assertion failures are never errors: they are report lines. These types
//! cover infrastructure problems that stop the harness from producing or
//! reading evidence at all.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Evidence could not be written or read.
#[derive(Error, Debug)]
pub enum EvidenceError {
    /// Filesystem operation failed.
    #[error("{}: {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// An artifact could not be serialized.
    #[error("serialize failed: {0}")]
    Serialize(String),
}

impl EvidenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Infrastructure failure during a harness run.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Evidence could not be written or read.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    /// Invalid command-line or scenario configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Other I/O failure, e.g. binding the simulation server.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
