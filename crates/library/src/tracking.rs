//! Invalidation with fan-out.
//!
//! Marks directories stale in the index (with all of their ancestors) and
//! purges every in-memory cache derived from them before returning.

use crate::cache::CacheRegistry;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use gallery_index::Database;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument;

#[derive(Clone)]
pub struct Invalidator {
    db: Database,
    caches: Arc<CacheRegistry>,
}
impl Invalidator {
    pub fn new(db: Database, caches: Arc<CacheRegistry>) -> Self {
        Self { db, caches }
    }

    /// Invalidate one directory and its ancestors.
    pub async fn invalidate(&self, directory_id: i64) -> Result<Vec<i64>> {
        self.invalidate_many(&[directory_id]).await
    }

    /// Invalidate the directory with this path hash, if indexed.
    pub async fn invalidate_hash(&self, path_hash: &str) -> Result<Vec<i64>> {
        let directory = self.db.directories().get_by_hash(path_hash).await.or_raise(|| ErrorKind::Index)?;
        match directory {
            Some(directory) => self.invalidate(directory.id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Invalidate directories and their ancestors. Returns every affected id.
    #[instrument(level = "debug", skip_all, fields(count = ids.len()))]
    pub async fn invalidate_many(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let affected = self.db.tracking().invalidate_many(ids).await.or_raise(|| ErrorKind::Index)?;
        self.caches.purge_directories(&affected);
        tracing::debug!(affected = affected.len(), "Invalidated directories");
        Ok(affected)
    }

    /// Invalidate the nearest indexed directory of each path.
    ///
    /// A path that is itself an indexed directory maps to that directory;
    /// anything else (a file, a directory never seen before, a deleted entry)
    /// maps to its deepest indexed ancestor.
    pub async fn invalidate_paths(&self, paths: &[PathBuf]) -> Result<Vec<i64>> {
        let nearest = self.db.directories().nearest_indexed(paths).await.or_raise(|| ErrorKind::Index)?;
        let ids: Vec<i64> = nearest.iter().map(|d| d.id).collect();
        self.invalidate_many(&ids).await
    }
}
