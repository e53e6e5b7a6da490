//! Named, expiring leases.
//!
//! Used to elect a single watcher among all processes sharing an index.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{from_millis, to_millis};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::{Duration, UtcDateTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub expires_at: UtcDateTime,
}

#[derive(Debug, Clone)]
pub struct Leases {
    pool: SqlitePool,
}
impl From<&Database> for Leases {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Leases {
    /// Acquire or renew a lease. Returns `false` if someone else holds it.
    pub async fn acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        self.acquire_at(name, holder, ttl, UtcDateTime::now()).await
    }

    /// Like [`Leases::acquire`], with an explicit clock.
    pub async fn acquire_at(&self, name: &str, holder: &str, ttl: Duration, now: UtcDateTime) -> Result<bool> {
        let result = sqlx::query(include_str!("../../queries/leases/acquire.sql"))
            .bind(name)
            .bind(holder)
            .bind(to_millis(now + ttl))
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() == 1)
    }

    /// Give up a lease, if still held by `holder`.
    pub async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query(include_str!("../../queries/leases/release.sql"))
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn current(&self, name: &str) -> Result<Option<Lease>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(include_str!("../../queries/leases/get.sql"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|(name, holder, expires_at)| Ok(Lease { name, holder, expires_at: from_millis(expires_at)? }))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let db = Database::connect_in_memory().await.unwrap();
        let leases = db.leases();
        let now = UtcDateTime::now();
        let ttl = Duration::seconds(30);
        assert!(leases.acquire_at("watcher", "a", ttl, now).await.unwrap());
        assert!(!leases.acquire_at("watcher", "b", ttl, now + Duration::seconds(10)).await.unwrap());
        // Renewal by the holder.
        assert!(leases.acquire_at("watcher", "a", ttl, now + Duration::seconds(20)).await.unwrap());
        assert!(!leases.acquire_at("watcher", "b", ttl, now + Duration::seconds(40)).await.unwrap());
        // Expired.
        assert!(leases.acquire_at("watcher", "b", ttl, now + Duration::seconds(60)).await.unwrap());
        assert_eq!(leases.current("watcher").await.unwrap().unwrap().holder, "b");
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let db = Database::connect_in_memory().await.unwrap();
        let leases = db.leases();
        assert!(leases.acquire("watcher", "a", Duration::seconds(30)).await.unwrap());
        assert!(!leases.release("watcher", "b").await.unwrap());
        assert!(leases.release("watcher", "a").await.unwrap());
        assert!(leases.current("watcher").await.unwrap().is_none());
        assert!(leases.acquire("watcher", "b", Duration::seconds(30)).await.unwrap());
    }
}
