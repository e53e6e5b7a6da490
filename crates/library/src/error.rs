//! Library Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Each larger module raises its own
//! error kind; the [`Library`](crate::Library) facade only ever surfaces the
//! kinds below.

use derive_more::{Display, Error};

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Nothing is indexed (or on disk) under this path or hash, even after a scan.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// A page beyond the last page of a listing was requested.
    #[display("page {page} out of range (total {total})")]
    PageOutOfRange { page: usize, total: usize },
    #[display("could not open the library")]
    Open,
    #[display("index operation failed")]
    Index,
    #[display("scan failed")]
    Scan,
    #[display("watcher failed")]
    Watch,
    #[display("thumbnail could not be produced")]
    Thumbnail,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Index | Self::Scan)
    }

    /// Returns `true` for the kinds a caller should present as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PageOutOfRange { .. })
    }
}
