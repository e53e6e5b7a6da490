//! # Gallery Index
//!
//! The durable half of the gallery: a SQLite database recording every indexed
//! directory and file, their freshness, and their rendered thumbnails.
//!
//! Records are addressed by hash rather than path (see [`hash`]), so a single
//! database can be shared by several processes browsing the same tree.

mod db;
pub mod error;
pub mod filetype;
pub mod hash;
mod models;
mod repo;

pub use crate::db::Database;
pub use crate::error::Error;
pub use crate::models::{
    DirectoryRecord, FileRecord, FileUpdate, NewFile, SortOrder, ThumbnailRecord, Tier, TrackingEntry, from_millis,
    to_millis,
};
pub use crate::repo::{
    BATCH_SIZE, Directories, Files, Lease, Leases, NewDirectory, PurgeReport, Thumbnails, Tracking,
};
