//! Domain-specific errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::model::Fingerprint;

/// Failures surfaced by bag loading, mutation and persistence.
#[derive(Debug, Error)]
pub enum BagError {
    #[error("unsupported bag format '{format}': only yml bags are supported")]
    FormatUnsupported { format: String },

    #[error("failed to read bag file {}", path.display())]
    ResourceRead {
        path: PathBuf,
        #[source]
        source: ReadFailure,
    },

    #[error("bag file not found: {}", path.display())]
    ResourceMissing { path: PathBuf },

    #[error("bag '{name}' is read only")]
    ReadOnlyViolation { name: String },

    #[error(
        "will not write to {}: file changed since it was loaded (expected fingerprint {expected}, found {found})",
        path.display()
    )]
    Conflict {
        path: PathBuf,
        expected: Fingerprint,
        found: Fingerprint,
    },

    #[error("failed to write bag file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: WriteFailure,
    },

    #[error("failed to lock bag file {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{operation} is not supported")]
    NotSupported { operation: &'static str },
}

impl BagError {
    /// Whether this error was caused by another writer changing the file.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BagError::Conflict { .. })
    }
}

/// Underlying cause of a [`BagError::ResourceRead`].
#[derive(Debug, Error)]
pub enum ReadFailure {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unexpected document layout: {0}")]
    Layout(String),
}

/// Underlying cause of a [`BagError::Write`].
#[derive(Debug, Error)]
pub enum WriteFailure {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to serialize bag: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("failed to replace bag file: {0}")]
    Persist(#[from] tempfile::PersistError),
}
