use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{ThumbnailRecord, ThumbnailRow, Tier, size_to_db, to_millis};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::UtcDateTime;

/// Rendered thumbnails, keyed by the content hash they were rendered from.
///
/// Archive covers are keyed by a member key instead, with `source_hash`
/// pointing at the archive's content so they are purged together with it.
#[derive(Debug, Clone)]
pub struct Thumbnails {
    pool: SqlitePool,
}
impl From<&Database> for Thumbnails {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Thumbnails {
    pub async fn get(&self, key: &str) -> Result<Option<ThumbnailRecord>> {
        let row: Option<ThumbnailRow> = sqlx::query_as(include_str!("../../queries/thumbnails/get.sql"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(ThumbnailRecord::try_from).transpose()
    }

    /// Store one rendered tier.
    ///
    /// The other tiers survive only if they were rendered from a source of
    /// the same size; otherwise they are stale and dropped.
    pub async fn store(&self, key: &str, source_hash: &str, source_size: u64, tier: Tier, bytes: &[u8]) -> Result<()> {
        let column = tier.column();
        let others = Tier::ALL
            .iter()
            .filter(|t| **t != tier)
            .map(|t| {
                let other = t.column();
                format!(
                    "{other} = CASE WHEN thumbnails.source_size = excluded.source_size THEN thumbnails.{other} ELSE NULL END"
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO thumbnails (content_hash, source_hash, source_size, {column}, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (content_hash) DO UPDATE SET \
                 {column} = excluded.{column}, {others}, \
                 source_hash = excluded.source_hash, \
                 source_size = excluded.source_size, \
                 created_at = excluded.created_at"
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(source_hash)
            .bind(size_to_db(source_size)?)
            .bind(bytes)
            .bind(to_millis(UtcDateTime::now()))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Delete thumbnails whose source content no longer backs any live file.
    pub async fn purge_orphans(&self) -> Result<u64> {
        let result = sqlx::query(include_str!("../../queries/thumbnails/purge_orphans.sql"))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() > 0 {
            tracing::info!(count = result.rows_affected(), "Purged orphaned thumbnails");
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_keeps_other_tiers_for_same_source() {
        let db = Database::connect_in_memory().await.unwrap();
        let thumbnails = db.thumbnails();
        thumbnails.store("abc", "abc", 10, Tier::Small, b"small").await.unwrap();
        thumbnails.store("abc", "abc", 10, Tier::Large, b"large").await.unwrap();
        let record = thumbnails.get("abc").await.unwrap().unwrap();
        assert_eq!(record.tier(Tier::Small), Some(&b"small"[..]));
        assert_eq!(record.tier(Tier::Large), Some(&b"large"[..]));
        assert_eq!(record.tier(Tier::Medium), None);
    }

    #[tokio::test]
    async fn test_store_drops_tiers_of_a_different_source_size() {
        let db = Database::connect_in_memory().await.unwrap();
        let thumbnails = db.thumbnails();
        thumbnails.store("abc", "abc", 10, Tier::Small, b"small").await.unwrap();
        thumbnails.store("abc", "abc", 20, Tier::Medium, b"medium").await.unwrap();
        let record = thumbnails.get("abc").await.unwrap().unwrap();
        assert_eq!(record.source_size, 20);
        assert_eq!(record.tier(Tier::Small), None);
        assert_eq!(record.tier(Tier::Medium), Some(&b"medium"[..]));
    }

    #[tokio::test]
    async fn test_empty_tier_reads_as_missing() {
        let db = Database::connect_in_memory().await.unwrap();
        db.thumbnails().store("abc", "abc", 1, Tier::Small, b"").await.unwrap();
        assert_eq!(db.thumbnails().get("abc").await.unwrap().unwrap().tier(Tier::Small), None);
    }

    #[tokio::test]
    async fn test_purge_orphans() {
        let db = Database::connect_in_memory().await.unwrap();
        db.thumbnails().store("abc", "abc", 1, Tier::Small, b"x").await.unwrap();
        db.thumbnails().store("abc/cover.jpg", "abc", 1, Tier::Small, b"x").await.unwrap();
        assert_eq!(db.thumbnails().purge_orphans().await.unwrap(), 2);
        assert_eq!(db.thumbnails().purge_orphans().await.unwrap(), 0);
    }
}
