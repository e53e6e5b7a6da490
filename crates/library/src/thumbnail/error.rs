//! Error types for the [`thumbnail`](super) module.

use derive_more::{Display, Error};

/// A thumbnail error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for thumbnail operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A [`Renderer`](super::Renderer) or [`ArchiveReader`](super::ArchiveReader)
    /// could not process the content.
    #[display("render failed: {_0}")]
    Render(#[error(not(source))] String),
    /// An archive contains no member that can serve as its cover.
    #[display("archive has no cover image")]
    NoCover,
    /// Reading the source file failed.
    Storage,
    /// The file on disk no longer matches its index record.
    #[display("source changed since it was indexed")]
    Changed,
    Index,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Changed | Self::Index)
    }

    /// Failures that mean the content itself can't be thumbnailed.
    pub(crate) fn is_content_failure(&self) -> bool {
        matches!(self, Self::Render(_) | Self::NoCover)
    }
}
