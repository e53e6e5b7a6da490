//! Browsing layer over the gallery index.
//!
//! The [`Library`] facade answers lookups, paginated listings and thumbnail
//! requests. Everything is lazy: directories are reconciled against the
//! filesystem only when read while stale, and the watcher (or an explicit
//! [`Library::invalidate`]) only marks them stale.
//!
//! # Architecture
//! - [`scan`]: one-directory reconciliation (diff, hash, batched write-back).
//! - Tracking: invalidation with ancestor fan-out plus cache purge.
//! - [`cache`]: bounded per-process LRU caches, purged synchronously.
//! - [`layout`]: pagination and distinct-content listings.
//! - [`thumbnail`]: content-addressed thumbnails and directory covers.
//! - [`watch`]: lease-elected filesystem watcher.

pub mod cache;
pub mod error;
pub mod layout;
pub mod scan;
pub mod thumbnail;
mod tracking;
pub mod watch;

pub use crate::cache::{CacheRegistry, CacheStats, RegistryStats};
pub use crate::error::Error;
pub use crate::layout::{DistinctListing, Layout, LayoutKey, LayoutManager, PageBreakdown, page_breakdown};
pub use crate::scan::{EntryFilter, ScanReport, Scanner};
pub use crate::thumbnail::{ArchiveReader, Renderer, Thumbnail, ThumbnailStore};
pub use crate::tracking::Invalidator;
pub use crate::watch::Watcher;

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use gallery_config::Config;
use gallery_index::filetype::FileTypes;
use gallery_index::hash::directory_key;
use gallery_index::{Database, DirectoryRecord, FileRecord, PurgeReport, SortOrder, Tier};
use gallery_storage::{BackendHandle, path_within};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Siblings of a directory: previous and next by name.
pub type Siblings = (Option<DirectoryRecord>, Option<DirectoryRecord>);

#[derive(Clone)]
pub struct Library {
    db: Database,
    root: PathBuf,
    config: Arc<Config>,
    caches: Arc<CacheRegistry>,
    invalidator: Invalidator,
    scanner: Scanner,
    layouts: Arc<LayoutManager>,
    thumbnails: Arc<ThumbnailStore>,
}
impl Library {
    /// Open the index configured in `config` over `backend`.
    pub async fn open(
        config: &Config,
        backend: BackendHandle,
        renderer: Arc<dyn Renderer>,
        archives: Option<Arc<dyn ArchiveReader>>,
    ) -> Result<Self> {
        let db = Database::connect(&config.database.path, config.database.max_connections)
            .await
            .or_raise(|| ErrorKind::Open)?;
        Self::with_database(db, config, backend, renderer, archives).await
    }

    /// Like [`Library::open`], over an already connected database.
    pub async fn with_database(
        db: Database,
        config: &Config,
        backend: BackendHandle,
        renderer: Arc<dyn Renderer>,
        archives: Option<Arc<dyn ArchiveReader>>,
    ) -> Result<Self> {
        let root = backend.root().to_path_buf();
        let filetypes = Arc::new(FileTypes::load(&db).await.or_raise(|| ErrorKind::Open)?);
        let caches = Arc::new(CacheRegistry::new(&config.cache));
        let invalidator = Invalidator::new(db.clone(), Arc::clone(&caches));
        let scanner = Scanner::new(
            db.clone(),
            Arc::clone(&backend),
            Arc::clone(&filetypes),
            Arc::clone(&caches),
            invalidator.clone(),
            EntryFilter::new(&config.library),
            root.clone(),
            config.library.scan_concurrency,
        );
        let layouts = Arc::new(LayoutManager::new(db.clone(), Arc::clone(&caches), config.library.page_size));
        let thumbnails = Arc::new(ThumbnailStore::new(
            db.clone(),
            backend,
            filetypes,
            Arc::clone(&caches),
            renderer,
            archives,
            config.library.cover_names.clone(),
        ));
        tracing::debug!(root = %root.display(), "Opened library");
        Ok(Self { db, root, config: Arc::new(config.clone()), caches, invalidator, scanner, layouts, thumbnails })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        path_within(&self.root, path).or_raise(|| ErrorKind::NotFound(path.display().to_string()))
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// The directory at `path`, scanning it once if it isn't indexed yet.
    pub async fn directory(&self, path: impl AsRef<Path>) -> Result<Arc<DirectoryRecord>> {
        let path = self.resolve(path.as_ref())?;
        let key = directory_key(&path).or_raise(|| ErrorKind::NotFound(path.display().to_string()))?;
        if let Some(directory) = self.caches.directory(&key) {
            return Ok(directory);
        }
        let mut found = self.db.directories().get_by_hash(&key).await.or_raise(|| ErrorKind::Index)?;
        if found.is_none() {
            self.reconcile(&path, false).await?;
            found = self.db.directories().get_by_hash(&key).await.or_raise(|| ErrorKind::Index)?;
        }
        let directory = Arc::new(found.ok_or_raise(|| ErrorKind::NotFound(path.display().to_string()))?);
        self.caches.insert_directory(Arc::clone(&directory));
        Ok(directory)
    }

    /// The live directory with this identity hash. Never scans.
    pub async fn directory_by_hash(&self, path_hash: &str) -> Result<Arc<DirectoryRecord>> {
        if let Some(directory) = self.caches.directory(path_hash) {
            return Ok(directory);
        }
        let found = self.db.directories().get_by_hash(path_hash).await.or_raise(|| ErrorKind::Index)?;
        let directory = Arc::new(found.ok_or_raise(|| ErrorKind::NotFound(path_hash.to_string()))?);
        self.caches.insert_directory(Arc::clone(&directory));
        Ok(directory)
    }

    /// The file at `path`, scanning its directory once if it isn't indexed yet.
    pub async fn file(&self, path: impl AsRef<Path>) -> Result<Arc<FileRecord>> {
        let path = self.resolve(path.as_ref())?;
        if let Some(file) = self.caches.file_by_path(&path) {
            return Ok(file);
        }
        let mut found = self.db.files().get_by_path(&path).await.or_raise(|| ErrorKind::Index)?;
        if found.is_none()
            && let Some(parent) = path.parent().filter(|p| p.starts_with(&self.root))
        {
            self.reconcile(parent, false).await?;
            found = self.db.files().get_by_path(&path).await.or_raise(|| ErrorKind::Index)?;
        }
        let file = Arc::new(found.ok_or_raise(|| ErrorKind::NotFound(path.display().to_string()))?);
        self.caches.insert_file(Arc::clone(&file));
        Ok(file)
    }

    /// The live file with this unique (content plus path) hash. Never scans.
    pub async fn file_by_hash(&self, unique_hash: &str) -> Result<Arc<FileRecord>> {
        if let Some(file) = self.caches.file(unique_hash) {
            return Ok(file);
        }
        let found = self.db.files().get_by_unique_hash(unique_hash).await.or_raise(|| ErrorKind::Index)?;
        let file = Arc::new(found.ok_or_raise(|| ErrorKind::NotFound(unique_hash.to_string()))?);
        self.caches.insert_file(Arc::clone(&file));
        Ok(file)
    }

    /// Every live copy of some content.
    pub async fn files_by_content_hash(&self, content_hash: &str) -> Result<Vec<FileRecord>> {
        self.db.files().get_by_content_hash(content_hash).await.or_raise(|| ErrorKind::Index)
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// Bring `path` up to date and return it with the generation it's valid at.
    async fn fresh(&self, path: &Path) -> Result<(Arc<DirectoryRecord>, i64)> {
        let report = self.reconcile(path, false).await?;
        if report.directory_id.is_none() {
            exn::bail!(ErrorKind::NotFound(path.display().to_string()));
        }
        Ok((self.directory(path).await?, report.generation))
    }

    /// One page of a directory: subdirectories first, then files.
    pub async fn listing(&self, path: impl AsRef<Path>, sort: SortOrder, page: usize) -> Result<Arc<Layout>> {
        let (directory, generation) = self.fresh(path.as_ref()).await?;
        self.layouts.page(&directory, sort, page, generation).await
    }

    /// A directory's files with duplicate content removed.
    pub async fn distinct(&self, path: impl AsRef<Path>, sort: SortOrder) -> Result<Arc<DistinctListing>> {
        let (directory, generation) = self.fresh(path.as_ref()).await?;
        self.layouts.distinct(&directory, sort, generation).await
    }

    pub async fn siblings(&self, path: impl AsRef<Path>) -> Result<Siblings> {
        let directory = self.directory(path).await?;
        self.layouts.siblings(&directory).await
    }

    // =========================================================================
    // Scanning & invalidation
    // =========================================================================

    /// Reconcile one directory if stale (or always, with `force`).
    ///
    /// The scan runs as its own task: dropping the returned future does not
    /// abort index writes already under way.
    pub async fn reconcile(&self, path: impl AsRef<Path>, force: bool) -> Result<ScanReport> {
        let scanner = self.scanner.clone();
        let path = path.as_ref().to_path_buf();
        tokio::spawn(async move { scanner.scan(path, force).await }).await.or_raise(|| ErrorKind::Scan)?
    }

    /// Index a directory (and its missing ancestors) right away.
    pub async fn add_directory(&self, path: impl AsRef<Path>) -> Result<Arc<DirectoryRecord>> {
        let path = self.resolve(path.as_ref())?;
        self.reconcile(&path, true).await?;
        self.directory(&path).await
    }

    /// Mark the nearest indexed directory of `path` stale, with its ancestors.
    pub async fn invalidate(&self, path: impl AsRef<Path>) -> Result<Vec<i64>> {
        let path = self.resolve(path.as_ref())?;
        self.invalidator.invalidate_paths(&[path]).await
    }

    /// Mark the directory with this identity hash stale, with its ancestors.
    pub async fn invalidate_hash(&self, path_hash: &str) -> Result<Vec<i64>> {
        self.invalidator.invalidate_hash(path_hash).await
    }

    pub async fn invalidate_many(&self, paths: &[PathBuf]) -> Result<Vec<i64>> {
        let paths = paths.iter().map(|p| self.resolve(p)).collect::<Result<Vec<_>>>()?;
        self.invalidator.invalidate_paths(&paths).await
    }

    /// A watcher over the library root, sharing this library's caches.
    pub fn watcher(&self) -> Watcher {
        Watcher::new(
            &self.db,
            self.invalidator.clone(),
            EntryFilter::new(&self.config.library),
            self.root.clone(),
            &self.config.watcher,
        )
    }

    // =========================================================================
    // Thumbnails
    // =========================================================================

    /// Thumbnail of the file at `path`, rescanning its directory first if stale.
    pub async fn thumbnail(&self, path: impl AsRef<Path>, tier: Tier) -> Result<Thumbnail> {
        let path = self.resolve(path.as_ref())?;
        // The record must describe the bytes that get rendered.
        if let Some(parent) = path.parent().filter(|p| p.starts_with(&self.root)) {
            self.reconcile(parent, false).await?;
        }
        let file = self.file(&path).await?;
        self.thumbnails.thumbnail(&file, tier).await
    }

    pub async fn directory_thumbnail(&self, path: impl AsRef<Path>, tier: Tier) -> Result<Thumbnail> {
        // Cover election needs the current children.
        let (directory, _) = self.fresh(path.as_ref()).await?;
        self.thumbnails.directory_thumbnail(&directory, tier).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Hard-delete tombstoned directories and files.
    pub async fn purge_tombstones(&self) -> Result<PurgeReport> {
        let report = self.db.directories().purge_tombstones().await.or_raise(|| ErrorKind::Index)?;
        tracing::info!(directories = report.directories, files = report.files, "Purged tombstones");
        Ok(report)
    }

    /// Delete thumbnails no live file references.
    pub async fn purge_orphaned_thumbnails(&self) -> Result<u64> {
        self.db.thumbnails().purge_orphans().await.or_raise(|| ErrorKind::Index)
    }

    pub fn cache_stats(&self) -> RegistryStats {
        self.caches.stats()
    }
}
