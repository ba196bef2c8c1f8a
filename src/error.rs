use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced across the public API boundary.
///
/// Every fallible operation on [`crate::cache::DiskCache`] returns one of
/// these instead of a bare `std::io::Error`, so callers can match on *why*
/// without re-deriving it from an `io::ErrorKind`.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("operation on a finalized editor or closed cache")]
    InvalidState,

    #[error("commit called without writing all {value_count} slot(s) for a new entry")]
    Incomplete { value_count: usize },

    #[error("commit failed for key hash {hash}: {source}")]
    CommitFailed {
        hash: String,
        #[source]
        source: std::io::Error,
    },

    #[error("key is already being edited")]
    Busy,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
