//! Error types for the [`scan`](super) module.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A scan error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for scan operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Neither on disk nor in the index.
    #[display("directory not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Not a valid path below the library root.
    #[display("outside the library: {}", _0.display())]
    OutsideRoot(#[error(not(source))] PathBuf),
    /// Listing the directory itself failed.
    Storage,
    /// Reading or hashing a single file failed.
    #[display("could not hash {}", _0.display())]
    Hash(#[error(not(source))] PathBuf),
    Index,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Index)
    }
}
