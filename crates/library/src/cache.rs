//! Process-local caches over the index.
//!
//! Every cache is a bounded LRU without expiry. Record caches keyed by hash
//! never need checking; everything derived from a directory's children stays
//! valid only until [`CacheRegistry::purge_directories`] runs for it, which
//! happens synchronously with invalidation.

use crate::layout::{DistinctListing, Layout, LayoutKey};
use gallery_config::CacheConfig;
use gallery_index::{DirectoryRecord, FileRecord, SortOrder};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::collections::HashSet;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of a single cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub directories: CacheStats,
    pub files: CacheStats,
    pub file_paths: CacheStats,
    pub layouts: CacheStats,
    pub distinct: CacheStats,
    pub archive_covers: CacheStats,
}

struct Counted<K, V> {
    cache: Cache<K, V>,
    hits: AtomicU64,
    misses: AtomicU64,
}
impl<K, V> Counted<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .support_invalidation_closures()
            .build();
        Self { cache, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = self.cache.get(key);
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    fn insert(&self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    /// Entries matching `predicate` are never returned again.
    fn purge_if(&self, predicate: impl Fn(&K, &V) -> bool + Send + Sync + 'static) {
        if let Err(e) = self.cache.invalidate_entries_if(predicate) {
            // Only possible without `support_invalidation_closures()`.
            tracing::error!(error = %e, "Cache rejected invalidation predicate; clearing it");
            self.cache.invalidate_all();
        }
    }

    fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}

/// All in-memory caches of one [`Library`](crate::Library).
pub struct CacheRegistry {
    /// By path hash.
    directories: Counted<String, Arc<DirectoryRecord>>,
    /// By unique hash.
    files: Counted<String, Arc<FileRecord>>,
    file_paths: Counted<PathBuf, Arc<FileRecord>>,
    layouts: Counted<LayoutKey, Arc<Layout>>,
    distinct: Counted<(i64, SortOrder), Arc<DistinctListing>>,
    /// Cover member of an archive, by the archive's content hash.
    archive_covers: Counted<String, Option<String>>,
}
impl CacheRegistry {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            directories: Counted::new(config.records),
            files: Counted::new(config.records),
            file_paths: Counted::new(config.records),
            layouts: Counted::new(config.layouts),
            distinct: Counted::new(config.distinct),
            archive_covers: Counted::new(config.records),
        }
    }

    pub fn directory(&self, path_hash: &str) -> Option<Arc<DirectoryRecord>> {
        self.directories.get(path_hash)
    }

    pub fn insert_directory(&self, directory: Arc<DirectoryRecord>) {
        self.directories.insert(directory.path_hash.clone(), directory);
    }

    pub fn file(&self, unique_hash: &str) -> Option<Arc<FileRecord>> {
        self.files.get(unique_hash)
    }

    pub fn file_by_path(&self, path: &Path) -> Option<Arc<FileRecord>> {
        self.file_paths.get(path)
    }

    pub fn insert_file(&self, file: Arc<FileRecord>) {
        self.file_paths.insert(file.path.clone(), Arc::clone(&file));
        self.files.insert(file.unique_hash.clone(), file);
    }

    pub fn layout(&self, key: &LayoutKey) -> Option<Arc<Layout>> {
        self.layouts.get(key)
    }

    pub fn insert_layout(&self, layout: Arc<Layout>) {
        self.layouts.insert(layout.key(), layout);
    }

    pub fn distinct(&self, directory_id: i64, sort: SortOrder) -> Option<Arc<DistinctListing>> {
        self.distinct.get(&(directory_id, sort))
    }

    pub fn insert_distinct(&self, listing: Arc<DistinctListing>) {
        self.distinct.insert((listing.directory_id, listing.sort), listing);
    }

    /// `None` inside means the archive is known to have no image member.
    pub fn archive_cover(&self, content_hash: &str) -> Option<Option<String>> {
        self.archive_covers.get(content_hash)
    }

    pub fn insert_archive_cover(&self, content_hash: &str, member: Option<String>) {
        self.archive_covers.insert(content_hash.to_string(), member);
    }

    /// Purge every record and listing belonging to these directories.
    pub fn purge_directories(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        let ids: Arc<HashSet<i64>> = Arc::new(ids.iter().copied().collect());
        let set = Arc::clone(&ids);
        self.directories.purge_if(move |_, d| set.contains(&d.id));
        let set = Arc::clone(&ids);
        self.files.purge_if(move |_, f| set.contains(&f.directory_id));
        let set = Arc::clone(&ids);
        self.file_paths.purge_if(move |_, f| set.contains(&f.directory_id));
        self.purge_listings(ids);
    }

    /// Purge only the paged and distinct listings of these directories.
    pub fn purge_layouts(&self, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        self.purge_listings(Arc::new(ids.iter().copied().collect()));
    }

    fn purge_listings(&self, ids: Arc<HashSet<i64>>) {
        let set = Arc::clone(&ids);
        self.layouts.purge_if(move |key, _| set.contains(&key.directory_id));
        self.distinct.purge_if(move |(id, _), _| ids.contains(id));
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            directories: self.directories.stats(),
            files: self.files.stats(),
            file_paths: self.file_paths.stats(),
            layouts: self.layouts.stats(),
            distinct: self.distinct.stats(),
            archive_covers: self.archive_covers.stats(),
        }
    }
}
