use crate::error::Error;
use crate::models::from_millis;
use time::UtcDateTime;

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TrackingRow {
    pub(crate) directory_id: i64,
    pub(crate) path_hash: String,
    pub(crate) invalidated: bool,
    pub(crate) generation: i64,
    pub(crate) last_scan: Option<i64>,
}

/// Durable freshness flag of one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEntry {
    pub directory_id: i64,
    pub path_hash: String,
    pub invalidated: bool,
    /// Incremented by every invalidation.
    pub generation: i64,
    pub last_scan: Option<UtcDateTime>,
}
impl TrackingEntry {
    pub fn is_valid(&self) -> bool {
        !self.invalidated
    }
}

impl TryFrom<TrackingRow> for TrackingEntry {
    type Error = Error;
    fn try_from(row: TrackingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            directory_id: row.directory_id,
            path_hash: row.path_hash,
            invalidated: row.invalidated,
            generation: row.generation,
            last_scan: row.last_scan.map(from_millis).transpose()?,
        })
    }
}
