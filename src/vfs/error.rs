use thiserror::Error;

use crate::cadapter::BackendError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("file busy: {0}")]
    Busy(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// An internal defect; reported instead of aborting the mount.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type FsResult<T> = Result<T, FsError>;
