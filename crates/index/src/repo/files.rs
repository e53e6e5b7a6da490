//! File records.
//!
//! New files are upserted on their unique hash. A file that changes in place
//! keeps its record and is updated by id; the `(directory, name)` index then
//! guarantees one live record per path.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::hash::directory_key;
use crate::models::{FileRecord, FileRow, FileUpdate, NewFile, SortOrder, size_to_db, to_millis};
use crate::repo::{BATCH_SIZE, is_unique_violation, push_id_list};
use exn::{OptionExt, ResultExt};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use tracing::instrument;

const SELECT: &str = include_str!("../../queries/files/select.sql");
const INSERT: &str = include_str!("../../queries/files/insert.sql");
const ON_CONFLICT: &str = include_str!("../../queries/files/on_conflict.sql");

/// Row values bound for an insert, in column order.
struct Bound {
    directory_id: i64,
    virtual_directory_id: Option<i64>,
    name: String,
    content_hash: String,
    unique_hash: String,
    size: i64,
    last_modified: i64,
    filetype: String,
    kind: &'static str,
    is_animated: bool,
}
impl TryFrom<&NewFile> for Bound {
    type Error = crate::Error;
    fn try_from(file: &NewFile) -> Result<Self> {
        Ok(Self {
            directory_id: file.directory_id,
            virtual_directory_id: file.virtual_directory_id,
            name: file.name.clone(),
            content_hash: file.hashes.content.clone(),
            unique_hash: file.hashes.unique.clone(),
            size: size_to_db(file.size)?,
            last_modified: to_millis(file.last_modified),
            filetype: file.filetype.clone(),
            kind: file.kind.as_str(),
            is_animated: file.is_animated,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Files {
    pool: SqlitePool,
}
impl From<&Database> for Files {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Files {
    async fn fetch_all(&self, builder: &mut QueryBuilder<'_, Sqlite>) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> =
            builder.build_query_as().fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    async fn fetch_optional(&self, builder: &mut QueryBuilder<'_, Sqlite>) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> =
            builder.build_query_as().fetch_optional(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        row.map(FileRecord::try_from).transpose()
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    /// Get a file by id, tombstoned or not.
    pub async fn get(&self, id: i64) -> Result<Option<FileRecord>> {
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE f.id = ").push_bind(id);
        self.fetch_optional(&mut builder).await
    }

    /// Get the live file with the given unique hash.
    pub async fn get_by_unique_hash(&self, unique_hash: &str) -> Result<Option<FileRecord>> {
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE f.delete_pending = 0 AND f.unique_hash = ").push_bind(unique_hash.to_string());
        self.fetch_optional(&mut builder).await
    }

    /// Get every live file with the given content, oldest record first.
    pub async fn get_by_content_hash(&self, content_hash: &str) -> Result<Vec<FileRecord>> {
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE f.delete_pending = 0 AND f.content_hash = ").push_bind(content_hash.to_string());
        builder.push(" ORDER BY f.id");
        self.fetch_all(&mut builder).await
    }

    /// Get the live file at a path.
    pub async fn get_by_path(&self, path: impl AsRef<Path>) -> Result<Option<FileRecord>> {
        let path = path.as_ref();
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Ok(None);
        };
        let name = name.to_str().ok_or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))?;
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE f.delete_pending = 0 AND d.delete_pending = 0 AND d.path_hash = ");
        builder.push_bind(directory_key(parent)?).push(" AND f.name = ").push_bind(name.to_string());
        self.fetch_optional(&mut builder).await
    }

    /// Live files of a directory.
    pub async fn children(&self, directory_id: i64, sort: SortOrder) -> Result<Vec<FileRecord>> {
        let mut builder = QueryBuilder::new(SELECT);
        builder.push(" WHERE f.delete_pending = 0 AND f.directory_id = ").push_bind(directory_id);
        builder.push(" ORDER BY ").push(sort.file_order());
        self.fetch_all(&mut builder).await
    }

    /// Which of the given files have no rendered small thumbnail yet.
    ///
    /// Only thumbnailable files that haven't already failed to render are
    /// considered. A stored thumbnail rendered from a different file size
    /// is stale and doesn't count.
    pub async fn lacking_thumbnails(&self, ids: &[i64]) -> Result<HashSet<i64>> {
        let mut lacking = HashSet::new();
        for chunk in ids.chunks(BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "SELECT f.id FROM files f \
                 JOIN filetypes ft ON ft.extension = f.filetype \
                 LEFT JOIN thumbnails t ON t.source_hash = f.content_hash \
                     AND t.source_size = f.size AND t.small IS NOT NULL AND length(t.small) > 0 \
                 WHERE f.generic_icon = 0 AND ft.generic = 0 \
                     AND f.kind IN ('image', 'movie', 'pdf', 'archive') \
                     AND t.content_hash IS NULL AND f.id IN",
            );
            push_id_list(&mut builder, chunk);
            let found: Vec<i64> =
                builder.build_query_scalar().fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
            lacking.extend(found);
        }
        Ok(lacking)
    }

    /// Directories holding a live file with the given content.
    pub async fn directories_with_content(&self, content_hash: &str) -> Result<Vec<i64>> {
        sqlx::query_scalar(include_str!("../../queries/files/directories_with_content.sql"))
            .bind(content_hash)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Whether any live copy of this content is flagged for the generic icon.
    pub async fn content_is_generic(&self, content_hash: &str) -> Result<bool> {
        sqlx::query_scalar(include_str!("../../queries/files/content_is_generic.sql"))
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Insert/Update
    // =========================================================================

    /// Insert new files in batches.
    ///
    /// Each batch is one transaction. If a batch hits a unique key taken by a
    /// concurrent writer, it is rolled back and replayed entry by entry: the
    /// existing record is re-fetched and updated instead, retried once.
    /// Returns the number of rows written.
    #[instrument(level = "debug", skip_all, fields(count = files.len()))]
    pub async fn upsert_many(&self, files: &[NewFile]) -> Result<u64> {
        let mut written = 0;
        for chunk in files.chunks(BATCH_SIZE) {
            let bound = chunk.iter().map(Bound::try_from).collect::<Result<Vec<_>>>()?;
            let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
            match Self::insert(&mut tx, bound).await {
                Ok(rows) => {
                    tx.commit().await.or_raise(|| ErrorKind::Database)?;
                    written += rows;
                },
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await.or_raise(|| ErrorKind::Database)?;
                    tracing::debug!("Conflicting upsert in batch; writing entries one by one");
                    for file in chunk {
                        written += self.upsert_one(file).await?;
                    }
                },
                Err(e) => return Err(e).or_raise(|| ErrorKind::Database),
            }
        }
        Ok(written)
    }

    async fn insert(conn: &mut SqliteConnection, rows: Vec<Bound>) -> sqlx::Result<u64> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(INSERT);
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.directory_id)
                .push_bind(row.virtual_directory_id)
                .push_bind(row.name)
                .push_bind(row.content_hash)
                .push_bind(row.unique_hash)
                .push_bind(row.size)
                .push_bind(row.last_modified)
                .push_bind(row.filetype)
                .push_bind(row.kind)
                .push_bind(row.is_animated);
        });
        builder.push(" ").push(ON_CONFLICT);
        Ok(builder.build().execute(&mut *conn).await?.rows_affected())
    }

    async fn upsert_one(&self, file: &NewFile) -> Result<u64> {
        for _ in 0..2 {
            let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
            match Self::insert(&mut conn, vec![Bound::try_from(file)?]).await {
                Ok(rows) => return Ok(rows),
                Err(e) if is_unique_violation(&e) => {},
                Err(e) => return Err(e).or_raise(|| ErrorKind::Database),
            }
            // Another record holds this (directory, name): it is the same file
            // with different bytes, so take it over.
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM files WHERE directory_id = ?1 AND name = ?2 AND delete_pending = 0",
            )
            .bind(file.directory_id)
            .bind(&file.name)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            if let Some(id) = existing {
                let update = FileUpdate { id, file: file.clone(), content_changed: true };
                match Self::update(&mut conn, &update).await {
                    Ok(rows) => return Ok(rows),
                    Err(e) if is_unique_violation(&e) => continue,
                    Err(e) => return Err(e).or_raise(|| ErrorKind::Database),
                }
            }
        }
        exn::bail!(ErrorKind::Conflict(file.name.clone()))
    }

    async fn update(conn: &mut SqliteConnection, update: &FileUpdate) -> sqlx::Result<u64> {
        let file = &update.file;
        let size = i64::try_from(file.size).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query(include_str!("../../queries/files/update.sql"))
            .bind(file.virtual_directory_id)
            .bind(&file.hashes.content)
            .bind(&file.hashes.unique)
            .bind(size)
            .bind(to_millis(file.last_modified))
            .bind(&file.filetype)
            .bind(file.kind.as_str())
            .bind(file.is_animated)
            .bind(update.content_changed)
            .bind(update.id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Update existing files in batched transactions.
    #[instrument(level = "debug", skip_all, fields(count = updates.len()))]
    pub async fn update_many(&self, updates: &[FileUpdate]) -> Result<u64> {
        let mut written = 0;
        for chunk in updates.chunks(BATCH_SIZE) {
            let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
            for update in chunk {
                written += Self::update(&mut tx, update).await.or_raise(|| ErrorKind::Database)?;
            }
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
        }
        Ok(written)
    }

    /// Flag (or unflag) every live file with the given content as unrenderable.
    ///
    /// Returns the directories whose files changed.
    pub async fn set_generic_icon(&self, content_hash: &str, generic: bool) -> Result<Vec<i64>> {
        let result = sqlx::query(include_str!("../../queries/files/set_generic_icon.sql"))
            .bind(content_hash)
            .bind(generic)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            return Ok(Vec::new());
        }
        self.directories_with_content(content_hash).await
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Tombstone files; they disappear from listings but keep their row.
    pub async fn tombstone_many(&self, ids: &[i64]) -> Result<u64> {
        let mut written = 0;
        for chunk in ids.chunks(BATCH_SIZE) {
            let mut builder = QueryBuilder::new("UPDATE files SET delete_pending = 1 WHERE delete_pending = 0 AND id IN");
            push_id_list(&mut builder, chunk);
            written += builder.build().execute(&self.pool).await.or_raise(|| ErrorKind::Database)?.rows_affected();
        }
        Ok(written)
    }
}
