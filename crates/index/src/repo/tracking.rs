//! Freshness tracking.
//!
//! Every directory has one tracking entry. Invalidating a directory bumps its
//! generation; a scan only marks the entry valid again if the generation it
//! started from is still current, so an invalidation that races a scan is
//! never lost.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{TrackingEntry, TrackingRow, to_millis};
use crate::repo::{BATCH_SIZE, Directories, push_id_list};
use exn::{OptionExt, ResultExt};
use sqlx::{QueryBuilder, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use time::UtcDateTime;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct Tracking {
    pool: SqlitePool,
}
impl From<&Database> for Tracking {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Tracking {
    pub async fn get(&self, directory_id: i64) -> Result<Option<TrackingEntry>> {
        let row: Option<TrackingRow> = sqlx::query_as(include_str!("../../queries/tracking/get.sql"))
            .bind(directory_id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(TrackingEntry::try_from).transpose()
    }

    /// Get the entry of a directory, creating an invalidated one if missing.
    pub async fn ensure(&self, directory_id: i64, path_hash: &str) -> Result<TrackingEntry> {
        sqlx::query(include_str!("../../queries/tracking/ensure.sql"))
            .bind(directory_id)
            .bind(path_hash)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        self.get(directory_id).await?.ok_or_raise(|| ErrorKind::InvalidData("tracking entry"))
    }

    /// A directory without an entry has never been scanned, so it isn't valid.
    pub async fn is_valid(&self, directory_id: i64) -> Result<bool> {
        Ok(self.get(directory_id).await?.is_some_and(|entry| entry.is_valid()))
    }

    /// Mark a directory valid, provided nothing invalidated it since `generation` was read.
    ///
    /// Also records the scan time on the directory itself. Returns `false`
    /// (and writes nothing) when the generation moved on.
    #[instrument(level = "debug", skip(self))]
    pub async fn mark_valid(&self, directory_id: i64, generation: i64, at: UtcDateTime) -> Result<bool> {
        let at = to_millis(at);
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let updated = sqlx::query(include_str!("../../queries/tracking/mark_valid.sql"))
            .bind(directory_id)
            .bind(generation)
            .bind(at)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
        if updated == 0 {
            tracing::debug!("Directory invalidated during scan; leaving it invalid");
            tx.rollback().await.or_raise(|| ErrorKind::Database)?;
            return Ok(false);
        }
        sqlx::query(include_str!("../../queries/tracking/mark_scanned.sql"))
            .bind(directory_id)
            .bind(at)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(true)
    }

    /// Invalidate exactly these directories, without touching their ancestors.
    pub async fn invalidate_only(&self, ids: &[i64]) -> Result<u64> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        Self::bump(&mut conn, ids).await
    }

    /// Invalidate one directory and every ancestor.
    pub async fn invalidate(&self, directory_id: i64) -> Result<Vec<i64>> {
        self.invalidate_many(&[directory_id]).await
    }

    /// Invalidate directories and all of their ancestors.
    ///
    /// An ancestor's listing (and cover) is derived from its descendants, so
    /// it goes stale with them. Elected covers and generic-icon flags of every
    /// affected directory are cleared. Returns every affected directory id.
    #[instrument(level = "debug", skip_all, fields(count = ids.len()))]
    pub async fn invalidate_many(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut affected: BTreeSet<i64> = ids.iter().copied().collect();
        let mut level: Vec<i64> = affected.iter().copied().collect();
        while !level.is_empty() {
            let parents = Directories::parent_ids(&mut tx, &level).await?;
            level = parents.into_iter().filter(|id| affected.insert(*id)).collect();
        }
        let affected: Vec<i64> = affected.into_iter().collect();
        Self::bump(&mut tx, &affected).await?;
        for chunk in affected.chunks(BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "UPDATE directories SET cover_file_id = NULL, generic_icon = 0 \
                 WHERE (cover_file_id IS NOT NULL OR generic_icon = 1) AND id IN",
            );
            push_id_list(&mut builder, chunk);
            builder.build().execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(affected)
    }

    async fn bump(conn: &mut SqliteConnection, ids: &[i64]) -> Result<u64> {
        let mut written = 0;
        for chunk in ids.chunks(BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "UPDATE cache_tracking SET invalidated = 1, generation = generation + 1 WHERE directory_id IN",
            );
            push_id_list(&mut builder, chunk);
            written += builder.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?.rows_affected();
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DirectoryRecord;

    async fn chain() -> (Database, DirectoryRecord, DirectoryRecord, DirectoryRecord) {
        let db = Database::connect_in_memory().await.unwrap();
        let now = UtcDateTime::now();
        let y = db.directories().materialize("/albums", "/albums/x/y", now).await.unwrap();
        let root = db.directories().get_by_path("/albums").await.unwrap().unwrap();
        let x = db.directories().get_by_path("/albums/x").await.unwrap().unwrap();
        (db, root, x, y)
    }

    #[tokio::test]
    async fn test_new_directories_are_invalid() {
        let (db, root, _, y) = chain().await;
        let tracking = db.tracking();
        assert!(!tracking.is_valid(y.id).await.unwrap());
        assert!(!tracking.is_valid(root.id).await.unwrap());
        assert!(!tracking.is_valid(9999).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_valid_records_scan_time() {
        let (db, _, _, y) = chain().await;
        let tracking = db.tracking();
        let entry = tracking.ensure(y.id, &y.path_hash).await.unwrap();
        assert!(tracking.mark_valid(y.id, entry.generation, UtcDateTime::now()).await.unwrap());
        assert!(tracking.is_valid(y.id).await.unwrap());
        let directory = db.directories().get(y.id).await.unwrap().unwrap();
        assert!(directory.last_scanned.is_some());
        assert!(tracking.get(y.id).await.unwrap().unwrap().last_scan.is_some());
    }

    #[tokio::test]
    async fn test_stale_generation_is_not_marked_valid() {
        let (db, _, _, y) = chain().await;
        let tracking = db.tracking();
        let entry = tracking.ensure(y.id, &y.path_hash).await.unwrap();
        // Invalidated while the scan was running.
        tracking.invalidate(y.id).await.unwrap();
        assert!(!tracking.mark_valid(y.id, entry.generation, UtcDateTime::now()).await.unwrap());
        assert!(!tracking.is_valid(y.id).await.unwrap());
        assert!(db.directories().get(y.id).await.unwrap().unwrap().last_scanned.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_fans_out_to_ancestors() {
        let (db, root, x, y) = chain().await;
        let tracking = db.tracking();
        for dir in [&root, &x, &y] {
            let entry = tracking.ensure(dir.id, &dir.path_hash).await.unwrap();
            tracking.mark_valid(dir.id, entry.generation, UtcDateTime::now()).await.unwrap();
        }
        let affected = tracking.invalidate(y.id).await.unwrap();
        assert_eq!(affected.len(), 3);
        for dir in [&root, &x, &y] {
            let entry = tracking.get(dir.id).await.unwrap().unwrap();
            assert!(!entry.is_valid());
            assert_eq!(entry.generation, 1);
        }
    }

    #[tokio::test]
    async fn test_invalidate_only_leaves_ancestors() {
        let (db, _, x, y) = chain().await;
        let tracking = db.tracking();
        let entry = tracking.ensure(x.id, &x.path_hash).await.unwrap();
        tracking.mark_valid(x.id, entry.generation, UtcDateTime::now()).await.unwrap();
        assert_eq!(tracking.invalidate_only(&[y.id]).await.unwrap(), 1);
        assert!(tracking.is_valid(x.id).await.unwrap());
        assert_eq!(tracking.get(y.id).await.unwrap().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_invalidate_clears_covers() {
        let (db, root, _, y) = chain().await;
        db.directories().set_generic_icon(root.id, true).await.unwrap();
        db.tracking().invalidate(y.id).await.unwrap();
        assert!(!db.directories().get(root.id).await.unwrap().unwrap().generic_icon);
    }
}
