// src/error.rs

use std::error::Error;
use std::path::PathBuf;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

/// Broad class of a [`TsqrError`]. Every class is fatal for the run that raised it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A row had the wrong number of columns or an undecodable encoding.
    Format,
    /// The run was misconfigured; raised before any stage is launched.
    Config,
    /// A Direct-Q phase 3 partition disagreed with what phase 1 recorded.
    Reconstruction,
    /// The linear algebra backend reported a failure.
    Backend,
    /// Reading or writing a side-input artifact failed.
    Io,
}

/// Errors raised by the TSQR stages and the Direct-Q coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TsqrError {
    #[error("row has {found} columns but the matrix has {expected}")]
    ColumnMismatch { expected: usize, found: usize },

    #[error("malformed row encoding: {0}")]
    MalformedRow(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("reconstruction mismatch for partition {partition}: {detail}")]
    ReconstructionMismatch { partition: String, detail: String },

    #[error("linear algebra backend failed: {0}")]
    Backend(ThreadSafeStdError),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact serialization failed: {0}")]
    Serialization(String),
}

impl TsqrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TsqrError::ColumnMismatch { .. } | TsqrError::MalformedRow(_) => ErrorKind::Format,
            TsqrError::Config(_) => ErrorKind::Config,
            TsqrError::ReconstructionMismatch { .. } => ErrorKind::Reconstruction,
            TsqrError::Backend(_) => ErrorKind::Backend,
            TsqrError::Io { .. } | TsqrError::Serialization(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        TsqrError::Config(msg.into())
    }

    pub(crate) fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        TsqrError::Io { path: path.into(), source }
    }
}

impl From<ThreadSafeStdError> for TsqrError {
    fn from(e: ThreadSafeStdError) -> Self {
        TsqrError::Backend(e)
    }
}

pub type Result<T, E = TsqrError> = std::result::Result<T, E>;
