//! Error types for the [`watch`](super) module.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The platform watcher could not be created or attached to the root.
    #[display("filesystem notifications unavailable")]
    Notify,
    /// Invalidating the directories behind an event batch failed.
    #[display("invalidation failed")]
    Invalidate,
    #[display("watcher lease operation failed")]
    Lease,
}
