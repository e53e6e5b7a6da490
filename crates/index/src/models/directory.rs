use crate::error::Error;
use crate::models::from_millis;
use std::path::PathBuf;
use time::UtcDateTime;

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct DirectoryRow {
    pub(crate) id: i64,
    pub(crate) path: String,
    pub(crate) path_hash: String,
    pub(crate) parent_id: Option<i64>,
    pub(crate) name: String,
    pub(crate) last_modified: i64,
    pub(crate) last_scanned: Option<i64>,
    pub(crate) delete_pending: bool,
    pub(crate) cover_file_id: Option<i64>,
    pub(crate) generic_icon: bool,
}

/// An indexed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub id: i64,
    /// Absolute, normalized path.
    pub path: PathBuf,
    /// Identity hash, see [`directory_key`](crate::hash::directory_key).
    pub path_hash: String,
    /// `None` only for the library root.
    pub parent_id: Option<i64>,
    pub name: String,
    pub last_modified: UtcDateTime,
    pub last_scanned: Option<UtcDateTime>,
    pub delete_pending: bool,
    /// File chosen to represent this directory, until the next invalidation.
    pub cover_file_id: Option<i64>,
    pub generic_icon: bool,
}

impl TryFrom<DirectoryRow> for DirectoryRecord {
    type Error = Error;
    fn try_from(row: DirectoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            path: PathBuf::from(row.path),
            path_hash: row.path_hash,
            parent_id: row.parent_id,
            name: row.name,
            last_modified: from_millis(row.last_modified)?,
            last_scanned: row.last_scanned.map(from_millis).transpose()?,
            delete_pending: row.delete_pending,
            cover_file_id: row.cover_file_id,
            generic_icon: row.generic_icon,
        })
    }
}
