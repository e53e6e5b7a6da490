//! Directory records.
//!
//! Directories are keyed by their path identity hash. Tombstoned records keep
//! their hash, but the partial unique index only covers live rows, so a
//! directory that disappears and comes back gets a fresh record.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::hash::{directory_key, directory_key_normalized, path_str};
use crate::models::{DirectoryRecord, DirectoryRow, SortOrder, to_millis};
use crate::repo::{BATCH_SIZE, push_id_list};
use exn::{OptionExt, ResultExt};
use gallery_storage::normalize_path;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tracing::instrument;

const SELECT: &str = include_str!("../../queries/directories/select.sql");

/// A subdirectory discovered on disk that has no live record yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDirectory {
    pub name: String,
    pub last_modified: UtcDateTime,
}

/// Rows removed by [`Directories::purge_tombstones`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub directories: u64,
    pub files: u64,
}

#[derive(Debug, Clone)]
pub struct Directories {
    pool: SqlitePool,
}
impl From<&Database> for Directories {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Directories {
    async fn fetch_optional(&self, builder: &mut QueryBuilder<'_, Sqlite>) -> Result<Option<DirectoryRecord>> {
        let row: Option<DirectoryRow> =
            builder.build_query_as().fetch_optional(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        row.map(DirectoryRecord::try_from).transpose()
    }

    async fn fetch_all(&self, builder: &mut QueryBuilder<'_, Sqlite>) -> Result<Vec<DirectoryRecord>> {
        let rows: Vec<DirectoryRow> =
            builder.build_query_as().fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(DirectoryRecord::try_from).collect()
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    /// Get a directory by id, tombstoned or not.
    pub async fn get(&self, id: i64) -> Result<Option<DirectoryRecord>> {
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE d.id = ").push_bind(id);
        self.fetch_optional(&mut builder).await
    }

    /// Get the live directory with the given identity hash.
    pub async fn get_by_hash(&self, path_hash: &str) -> Result<Option<DirectoryRecord>> {
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE d.delete_pending = 0 AND d.path_hash = ").push_bind(path_hash.to_string());
        self.fetch_optional(&mut builder).await
    }

    /// Get the live directory at a path.
    pub async fn get_by_path(&self, path: impl AsRef<Path>) -> Result<Option<DirectoryRecord>> {
        self.get_by_hash(&directory_key(path)?).await
    }

    /// Get every live directory whose identity hash is in `hashes`.
    pub async fn get_many_by_hash(&self, hashes: &[String]) -> Result<Vec<DirectoryRecord>> {
        let mut records = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(BATCH_SIZE) {
            let mut builder = QueryBuilder::new(SELECT);
            builder.push(" WHERE d.delete_pending = 0 AND d.path_hash IN (");
            let mut separated = builder.separated(", ");
            for hash in chunk {
                separated.push_bind(hash.clone());
            }
            separated.push_unseparated(")");
            records.extend(self.fetch_all(&mut builder).await?);
        }
        Ok(records)
    }

    /// Resolve each path to its nearest indexed directory.
    ///
    /// That is the path itself when it is an indexed directory, otherwise its
    /// deepest indexed ancestor. Every candidate is looked up in one batched
    /// query. Paths with no indexed ancestor at all are dropped, and the
    /// result contains each directory once.
    pub async fn nearest_indexed(&self, paths: &[PathBuf]) -> Result<Vec<DirectoryRecord>> {
        let mut candidates: Vec<Vec<String>> = Vec::with_capacity(paths.len());
        let mut unique: HashSet<String> = HashSet::new();
        for path in paths {
            let Ok(path) = normalize_path(path) else {
                tracing::debug!(path = %path.display(), "Ignoring unresolvable path");
                continue;
            };
            let hashes = path.ancestors().map(directory_key_normalized).collect::<Result<Vec<_>>>()?;
            unique.extend(hashes.iter().cloned());
            candidates.push(hashes);
        }
        let unique: Vec<String> = unique.into_iter().collect();
        let found: HashMap<String, DirectoryRecord> =
            self.get_many_by_hash(&unique).await?.into_iter().map(|d| (d.path_hash.clone(), d)).collect();
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for hashes in candidates {
            // Ancestors are ordered deepest first.
            if let Some(record) = hashes.iter().find_map(|h| found.get(h))
                && seen.insert(record.id)
            {
                resolved.push(record.clone());
            }
        }
        Ok(resolved)
    }

    /// Live subdirectories of a directory.
    pub async fn children(&self, id: i64, sort: SortOrder) -> Result<Vec<DirectoryRecord>> {
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE d.delete_pending = 0 AND d.parent_id = ").push_bind(id);
        builder.push(" ORDER BY ").push(sort.directory_order());
        self.fetch_all(&mut builder).await
    }

    /// Previous and next live sibling of a directory, ordered by name.
    pub async fn siblings(&self, directory: &DirectoryRecord) -> Result<(Option<DirectoryRecord>, Option<DirectoryRecord>)> {
        let Some(parent_id) = directory.parent_id else {
            return Ok((None, None));
        };
        let mut siblings = self.children(parent_id, SortOrder::Name).await?;
        let Some(position) = siblings.iter().position(|d| d.id == directory.id) else {
            return Ok((None, None));
        };
        let next = (position + 1 < siblings.len()).then(|| siblings.swap_remove(position + 1));
        let previous = position.checked_sub(1).map(|p| siblings.swap_remove(p));
        Ok((previous, next))
    }

    /// Ids of a directory and every live directory below it.
    pub async fn subtree_ids(&self, id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar(include_str!("../../queries/directories/subtree_ids.sql"))
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Insert/Update
    // =========================================================================

    /// Make sure `path` and every ancestor up to `root` has a live record.
    ///
    /// Pre-existing ancestors keep their data but get their parent link
    /// corrected if it points anywhere else. New records start with an
    /// invalidated tracking entry. When the whole chain already exists and
    /// is linked correctly, nothing is written.
    ///
    /// `last_modified` is used for `path` itself if it has to be created;
    /// created ancestors start at the epoch until their parent is scanned.
    #[instrument(level = "debug", skip(self, root), fields(path = %path.as_ref().display()))]
    pub async fn materialize(
        &self,
        root: impl AsRef<Path>,
        path: impl AsRef<Path>,
        last_modified: UtcDateTime,
    ) -> Result<DirectoryRecord> {
        let root = normalize_path(root.as_ref()).or_raise(|| ErrorKind::InvalidPath(root.as_ref().to_path_buf()))?;
        let path = normalize_path(path.as_ref()).or_raise(|| ErrorKind::InvalidPath(path.as_ref().to_path_buf()))?;
        if !path.starts_with(&root) {
            exn::bail!(ErrorKind::InvalidPath(path));
        }
        let mut chain: Vec<PathBuf> = path.ancestors().take_while(|a| a.starts_with(&root)).map(Path::to_path_buf).collect();
        chain.reverse();
        let hashes = chain.iter().map(|p| directory_key_normalized(p)).collect::<Result<Vec<_>>>()?;
        let existing: HashMap<String, DirectoryRecord> =
            self.get_many_by_hash(&hashes).await?.into_iter().map(|d| (d.path_hash.clone(), d)).collect();

        let mut parent_id = None;
        let mut linked = true;
        for hash in &hashes {
            match existing.get(hash) {
                Some(record) if record.parent_id == parent_id => parent_id = Some(record.id),
                _ => {
                    linked = false;
                    break;
                },
            }
        }
        if linked {
            let last = hashes.last().and_then(|h| existing.get(h)).cloned();
            return last.ok_or_raise(|| ErrorKind::DirectoryNotFound(path));
        }

        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut parent_id = None;
        let mut record = None;
        for (level, (dir, hash)) in chain.iter().zip(&hashes).enumerate() {
            let current = match existing.get(hash) {
                Some(existing) if existing.parent_id == parent_id => existing.clone(),
                _ => {
                    let modified = match level + 1 == chain.len() {
                        true => last_modified,
                        false => UtcDateTime::UNIX_EPOCH,
                    };
                    let created = Self::upsert(&mut tx, dir, hash, parent_id, modified).await?;
                    tracing::debug!(path = %dir.display(), id = created.id, "Materialized directory");
                    created
                },
            };
            parent_id = Some(current.id);
            record = Some(current);
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        record.ok_or_raise(|| ErrorKind::DirectoryNotFound(path))
    }

    async fn upsert(
        conn: &mut SqliteConnection,
        path: &Path,
        hash: &str,
        parent_id: Option<i64>,
        last_modified: UtcDateTime,
    ) -> Result<DirectoryRecord> {
        let name = match path.file_name() {
            Some(name) => name.to_str().ok_or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))?,
            None => "/",
        };
        let row: DirectoryRow = sqlx::query_as(include_str!("../../queries/directories/upsert.sql"))
            .bind(path_str(path)?)
            .bind(hash)
            .bind(parent_id)
            .bind(name)
            .bind(to_millis(last_modified))
            .fetch_one(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../../queries/tracking/ensure.sql"))
            .bind(row.id)
            .bind(&row.path_hash)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        DirectoryRecord::try_from(row)
    }

    /// Create records for newly discovered subdirectories of `parent`.
    ///
    /// Keyed on the identity hash, so a child created concurrently by another
    /// scan is adopted rather than duplicated.
    pub async fn create_children(&self, parent: &DirectoryRecord, children: &[NewDirectory]) -> Result<Vec<DirectoryRecord>> {
        let mut created = Vec::with_capacity(children.len());
        for chunk in children.chunks(BATCH_SIZE) {
            let mut rows = Vec::with_capacity(chunk.len());
            for child in chunk {
                let path = parent.path.join(&child.name);
                let hash = directory_key_normalized(&path)?;
                rows.push((path_str(&path)?.to_string(), hash, child.name.clone(), to_millis(child.last_modified)));
            }
            let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO directories (path, path_hash, parent_id, name, last_modified) ");
            builder.push_values(rows, |mut b, (path, hash, name, modified)| {
                b.push_bind(path).push_bind(hash).push_bind(parent.id).push_bind(name).push_bind(modified);
            });
            builder.push(
                " ON CONFLICT (path_hash) WHERE delete_pending = 0 DO UPDATE SET \
                 parent_id = excluded.parent_id, last_modified = excluded.last_modified \
                 RETURNING id, path, path_hash, parent_id, name, last_modified, last_scanned, \
                 delete_pending, cover_file_id, generic_icon",
            );
            let inserted: Vec<DirectoryRow> =
                builder.build_query_as().fetch_all(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
            if inserted.is_empty() {
                continue;
            }
            let mut tracking: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO cache_tracking (directory_id, path_hash) ");
            tracking.push_values(inserted.iter(), |mut b, row| {
                b.push_bind(row.id).push_bind(row.path_hash.clone());
            });
            tracking.push(" ON CONFLICT (directory_id) DO NOTHING");
            tracking.build().execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
            for row in inserted {
                created.push(DirectoryRecord::try_from(row)?);
            }
        }
        Ok(created)
    }

    /// Record new modification times for existing directories.
    pub async fn update_modified(&self, updates: &[(i64, UtcDateTime)]) -> Result<()> {
        for chunk in updates.chunks(BATCH_SIZE) {
            let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
            for (id, modified) in chunk {
                sqlx::query("UPDATE directories SET last_modified = ?1 WHERE id = ?2")
                    .bind(to_millis(*modified))
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
            }
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }

    pub async fn set_cover(&self, id: i64, file_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE directories SET cover_file_id = ?1 WHERE id = ?2")
            .bind(file_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn set_generic_icon(&self, id: i64, generic: bool) -> Result<()> {
        sqlx::query("UPDATE directories SET generic_icon = ?1 WHERE id = ?2")
            .bind(generic)
            .bind(id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Forget the elected cover (and any cover failure) of a directory.
    ///
    /// Returns `false` if there was nothing to clear.
    pub async fn clear_cover(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(include_str!("../../queries/directories/clear_cover.sql"))
            .bind(id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Tombstone directories along with everything below them.
    ///
    /// Tracking entries of the whole subtree are invalidated (without
    /// ancestor fan-out). Returns the ids of every tombstoned directory.
    #[instrument(level = "debug", skip(self))]
    pub async fn tombstone_subtrees(&self, ids: &[i64]) -> Result<Vec<i64>> {
        let mut tombstoned = Vec::new();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for id in ids {
            let subtree: Vec<i64> = sqlx::query_scalar(include_str!("../../queries/directories/subtree_ids.sql"))
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            for query in [
                include_str!("../../queries/directories/tombstone_subtree_files.sql"),
                include_str!("../../queries/directories/tombstone_subtree_tracking.sql"),
                include_str!("../../queries/directories/tombstone_subtree.sql"),
            ] {
                sqlx::query(query).bind(id).execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
            }
            tombstoned.extend(subtree);
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(tombstoned)
    }

    /// Permanently remove tombstoned files and directories.
    pub async fn purge_tombstones(&self) -> Result<PurgeReport> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let files = sqlx::query(include_str!("../../queries/files/purge_tombstones.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
        // Cascades remove nested tombstones before the statement reaches
        // them, so the affected row count would undercount.
        let directories: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM directories WHERE delete_pending = 1")
            .fetch_one(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../../queries/directories/purge_tombstones.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(PurgeReport { directories: directories.unsigned_abs(), files })
    }

    /// Parent ids of the given directories, without duplicates.
    pub(crate) async fn parent_ids(conn: &mut SqliteConnection, ids: &[i64]) -> Result<Vec<i64>> {
        let mut parents = Vec::new();
        for chunk in ids.chunks(BATCH_SIZE) {
            let mut builder = QueryBuilder::new("SELECT DISTINCT parent_id FROM directories WHERE parent_id IS NOT NULL AND id IN");
            push_id_list(&mut builder, chunk);
            let found: Vec<i64> =
                builder.build_query_scalar().fetch_all(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
            parents.extend(found);
        }
        parents.sort_unstable();
        parents.dedup();
        Ok(parents)
    }
}
