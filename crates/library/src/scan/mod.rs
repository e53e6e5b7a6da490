//! Reconciles one directory of the filesystem against the index.
//!
//! A scan never walks a subtree: subdirectories are created, invalidated or
//! tombstoned, and get scanned themselves when something reads them.

mod diff;
pub(crate) mod error;
mod filter;

pub use self::filter::EntryFilter;
use crate::cache::CacheRegistry;
use crate::error::{ErrorKind as LibraryErrorKind, Result as LibraryResult};
use crate::scan::diff::{Diff, diff};
use crate::scan::error::{ErrorKind, Result};
use crate::tracking::Invalidator;
use exn::ResultExt;
use futures::{StreamExt, stream};
use gallery_index::filetype::{FileKind, FileTypes};
use gallery_index::hash::{FileHashes, FileHasher, link_hashes};
use gallery_index::{Database, DirectoryRecord, FileRecord, FileUpdate, NewFile, SortOrder, to_millis};
use gallery_storage::error::ErrorKind as StorageErrorKind;
use gallery_storage::{BackendHandle, Entry, EntryKind, path_within};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::UtcDateTime;
use tracing::instrument;

/// Outcome of one [`Scanner::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// `None` when the directory was removed.
    pub directory_id: Option<i64>,
    /// The directory was valid and nothing was read.
    pub fresh: bool,
    /// The directory is gone from disk; its subtree was tombstoned.
    pub removed: bool,
    pub created: usize,
    pub updated: usize,
    pub tombstoned: usize,
    /// Entries that failed to list or hash and were left alone.
    pub skipped: usize,
    /// Tracking generation the scan started from.
    pub generation: i64,
}
impl ScanReport {
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.tombstoned > 0
    }
}

#[derive(Clone)]
pub struct Scanner {
    db: Database,
    backend: BackendHandle,
    filetypes: Arc<FileTypes>,
    caches: Arc<CacheRegistry>,
    invalidator: Invalidator,
    filter: EntryFilter,
    root: PathBuf,
    concurrency: usize,
}
impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        backend: BackendHandle,
        filetypes: Arc<FileTypes>,
        caches: Arc<CacheRegistry>,
        invalidator: Invalidator,
        filter: EntryFilter,
        root: PathBuf,
        concurrency: usize,
    ) -> Self {
        Self { db, backend, filetypes, caches, invalidator, filter, root, concurrency: concurrency.max(1) }
    }

    /// Reconcile the directory at `path`.
    ///
    /// Unless `force` is set, a directory whose tracking entry is valid is
    /// left alone without touching the filesystem.
    pub async fn scan(&self, path: impl AsRef<Path>, force: bool) -> LibraryResult<ScanReport> {
        let path = path.as_ref();
        match self.scan_inner(path, force).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let kind = match &*e {
                    ErrorKind::NotFound(p) | ErrorKind::OutsideRoot(p) => LibraryErrorKind::NotFound(p.display().to_string()),
                    _ => LibraryErrorKind::Scan,
                };
                Err(e.raise(kind))
            },
        }
    }

    #[instrument(level = "debug", skip(self, path), fields(path = %path.display()))]
    async fn scan_inner(&self, path: &Path, force: bool) -> Result<ScanReport> {
        let path = path_within(&self.root, path).or_raise(|| ErrorKind::OutsideRoot(path.to_path_buf()))?;
        let existing = self.db.directories().get_by_path(&path).await.or_raise(|| ErrorKind::Index)?;
        if let Some(directory) = &existing
            && !force
            && let Some(entry) = self.db.tracking().get(directory.id).await.or_raise(|| ErrorKind::Index)?
            && entry.is_valid()
        {
            return Ok(ScanReport {
                directory_id: Some(directory.id),
                fresh: true,
                generation: entry.generation,
                ..ScanReport::default()
            });
        }

        let stat = match self.backend.stat(&path).await {
            Ok(stat) if stat.is_dir() => Some(stat),
            Ok(_) => None,
            Err(e) if matches!(&*e, StorageErrorKind::NotFound(_) | StorageErrorKind::NotADirectory(_)) => None,
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        };
        let Some(stat) = stat else {
            return match existing {
                Some(directory) => self.remove(&directory).await,
                None => exn::bail!(ErrorKind::NotFound(path)),
            };
        };

        let directory =
            self.db.directories().materialize(&self.root, &path, stat.modified).await.or_raise(|| ErrorKind::Index)?;
        let tracking =
            self.db.tracking().ensure(directory.id, &directory.path_hash).await.or_raise(|| ErrorKind::Index)?;
        let generation = tracking.generation;

        let (entries, mut skipped) = self.list(&path).await?;
        let directories = self.db.directories().children(directory.id, SortOrder::Name).await.or_raise(|| ErrorKind::Index)?;
        let files = self.db.files().children(directory.id, SortOrder::Name).await.or_raise(|| ErrorKind::Index)?;
        let changes = diff(directories, files, entries, &skipped);

        let mut report = ScanReport { directory_id: Some(directory.id), generation, ..ScanReport::default() };
        if !changes.is_empty() {
            self.write_back(&directory, changes, &mut skipped, &mut report).await?;
        }
        report.skipped = skipped.len();

        let modified = !same_time(directory.last_modified, stat.modified);
        if modified {
            self.db
                .directories()
                .update_modified(&[(directory.id, stat.modified)])
                .await
                .or_raise(|| ErrorKind::Index)?;
        }
        if report.changed() {
            self.db.directories().clear_cover(directory.id).await.or_raise(|| ErrorKind::Index)?;
        }
        if report.changed() || modified {
            self.caches.purge_directories(&[directory.id]);
        }

        // Entries left out of the index keep the directory stale, so the next read retries them.
        let valid = if report.skipped > 0 {
            self.db.tracking().invalidate_only(&[directory.id]).await.or_raise(|| ErrorKind::Index)?;
            false
        } else {
            self.db
                .tracking()
                .mark_valid(directory.id, generation, UtcDateTime::now())
                .await
                .or_raise(|| ErrorKind::Index)?
        };
        tracing::debug!(
            created = report.created,
            updated = report.updated,
            tombstoned = report.tombstoned,
            skipped = report.skipped,
            valid,
            "Scanned directory"
        );
        Ok(report)
    }

    /// List and filter a directory. Returns the entries plus the names of
    /// entries that could not be read.
    async fn list(&self, path: &Path) -> Result<(Vec<Entry>, HashSet<String>)> {
        let mut entries = Vec::new();
        let mut skipped = HashSet::new();
        let mut listing = self.backend.list_stream(path);
        while let Some(result) = listing.next().await {
            match result {
                Ok(entry) if !self.filter.allows(&entry) => {},
                Ok(entry) => match &entry.kind {
                    EntryKind::DirectoryLink(target) if !target.starts_with(&self.root) => {
                        tracing::debug!(path = %entry.path.display(), target = %target.display(), "Skipping link leaving the library");
                    },
                    _ => entries.push(entry),
                },
                Err(e) if e.is_entry_local() && e.path().is_some_and(|p| p != path) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    if let Some(name) = e.path().and_then(Path::file_name).and_then(|n| n.to_str()) {
                        skipped.insert(name.to_string());
                    }
                },
                Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
            }
        }
        Ok((entries, skipped))
    }

    async fn write_back(
        &self,
        directory: &DirectoryRecord,
        changes: Diff,
        skipped: &mut HashSet<String>,
        report: &mut ScanReport,
    ) -> Result<()> {
        let directories = self.db.directories();
        let files = self.db.files();

        if !changes.new_directories.is_empty() {
            let created =
                directories.create_children(directory, &changes.new_directories).await.or_raise(|| ErrorKind::Index)?;
            report.created += created.len();
        }
        if !changes.modified_directories.is_empty() {
            directories.update_modified(&changes.modified_directories).await.or_raise(|| ErrorKind::Index)?;
            let ids: Vec<i64> = changes.modified_directories.iter().map(|(id, _)| *id).collect();
            // Only the subdirectories themselves: this directory is being revalidated.
            self.db.tracking().invalidate_only(&ids).await.or_raise(|| ErrorKind::Index)?;
            self.caches.purge_directories(&ids);
            report.updated += ids.len();
        }
        if !changes.removed_directories.is_empty() {
            let subtree =
                directories.tombstone_subtrees(&changes.removed_directories).await.or_raise(|| ErrorKind::Index)?;
            self.caches.purge_directories(&subtree);
            report.tombstoned += changes.removed_directories.len();
        }

        let work = changes
            .new_files
            .into_iter()
            .map(|entry| (None, entry))
            .chain(changes.changed_files.into_iter().map(|(record, entry)| (Some(record), entry)));
        let hashed: Vec<(Option<FileRecord>, Entry, Result<FileHashes>)> = stream::iter(work)
            .map(|(record, entry)| async move {
                let hashes = self.hash(&entry).await;
                (record, entry, hashes)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for (record, entry, hashes) in hashed {
            let hashes = match hashes {
                Ok(hashes) => hashes,
                Err(e) => {
                    tracing::warn!(error = ?e, "Skipping file that could not be hashed");
                    skipped.insert(entry.name);
                    continue;
                },
            };
            let file = self.new_file(directory, &entry, hashes).await?;
            match record {
                None => inserts.push(file),
                Some(record) => {
                    let content_changed = record.content_hash != file.hashes.content;
                    updates.push(FileUpdate { id: record.id, file, content_changed });
                },
            }
        }
        if !inserts.is_empty() {
            files.upsert_many(&inserts).await.or_raise(|| ErrorKind::Index)?;
            report.created += inserts.len();
        }
        if !updates.is_empty() {
            files.update_many(&updates).await.or_raise(|| ErrorKind::Index)?;
            report.updated += updates.len();
        }
        if !changes.removed_files.is_empty() {
            files.tombstone_many(&changes.removed_files).await.or_raise(|| ErrorKind::Index)?;
            report.tombstoned += changes.removed_files.len();
        }
        Ok(())
    }

    async fn hash(&self, entry: &Entry) -> Result<FileHashes> {
        if let EntryKind::DirectoryLink(target) = &entry.kind {
            return link_hashes(target, &entry.path).or_raise(|| ErrorKind::Hash(entry.path.clone()));
        }
        let reader = self.backend.reader(&entry.path).await.or_raise(|| ErrorKind::Hash(entry.path.clone()))?;
        let path = entry.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut hasher = FileHasher::new();
            hasher.read_all(reader).or_raise(|| ErrorKind::Hash(path.clone()))?;
            hasher.finish(&path).or_raise(|| ErrorKind::Hash(path.clone()))
        })
        .await
        .or_raise(|| ErrorKind::Hash(entry.path.clone()))?
    }

    async fn new_file(&self, directory: &DirectoryRecord, entry: &Entry, hashes: FileHashes) -> Result<NewFile> {
        let (filetype, virtual_directory_id) = match &entry.kind {
            EntryKind::DirectoryLink(target) => {
                let target = self
                    .db
                    .directories()
                    .materialize(&self.root, target, entry.modified)
                    .await
                    .or_raise(|| ErrorKind::Index)?;
                (self.filetypes.link(), Some(target.id))
            },
            _ => (self.filetypes.classify(&entry.name), None),
        };
        Ok(NewFile {
            directory_id: directory.id,
            virtual_directory_id,
            name: entry.name.clone(),
            hashes,
            size: entry.size,
            last_modified: entry.modified,
            filetype: filetype.extension.clone(),
            kind: filetype.kind,
            is_animated: filetype.kind == FileKind::Image && filetype.extension == "gif",
        })
    }

    /// The directory vanished from disk: tombstone its subtree and
    /// invalidate what is left above it.
    async fn remove(&self, directory: &DirectoryRecord) -> Result<ScanReport> {
        tracing::info!(path = %directory.path.display(), "Directory no longer exists; removing it from the index");
        let subtree = self.db.directories().tombstone_subtrees(&[directory.id]).await.or_raise(|| ErrorKind::Index)?;
        self.caches.purge_directories(&subtree);
        if let Some(parent) = directory.parent_id {
            self.invalidator.invalidate(parent).await.or_raise(|| ErrorKind::Index)?;
        }
        Ok(ScanReport { removed: true, tombstoned: subtree.len(), ..ScanReport::default() })
    }
}

fn same_time(a: UtcDateTime, b: UtcDateTime) -> bool {
    to_millis(a) == to_millis(b)
}
