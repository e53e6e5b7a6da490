//! Repositories over the index tables.
//!
//! Each repository is a cheap handle around the shared pool, created with
//! `From<&Database>` or the matching [`Database`](crate::Database) accessor.
//! Queries that touch many rows are chunked into groups of [`BATCH_SIZE`].

mod directories;
mod files;
mod leases;
mod thumbnails;
mod tracking;

pub use self::directories::{Directories, NewDirectory, PurgeReport};
pub use self::files::Files;
pub use self::leases::{Lease, Leases};
pub use self::thumbnails::Thumbnails;
pub use self::tracking::Tracking;

use sqlx::{QueryBuilder, Sqlite};

/// Upper bound on rows per bulk statement (and per write-back transaction).
pub const BATCH_SIZE: usize = 500;

/// Append ` (?, ?, ...)` for a list of ids.
pub(crate) fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    builder.push(" (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.is_unique_violation())
}
