//! Paged child listings.
//!
//! A directory's children form one sequence: its subdirectories first, then
//! its files, each sorted by the requested [`SortOrder`]. Pages are 1-based
//! slices of that sequence.

use crate::cache::CacheRegistry;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use gallery_index::{Database, DirectoryRecord, FileRecord, SortOrder};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutKey {
    pub directory_id: i64,
    pub sort: SortOrder,
    pub page: usize,
}

/// Which part of the child sequence lands on one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBreakdown {
    pub total_pages: usize,
    /// Indexes into the sorted subdirectories.
    pub directories: Range<usize>,
    /// Indexes into the sorted files.
    pub files: Range<usize>,
}

/// Split `dir_count + file_count` children into pages of `page_size`.
///
/// Returns `None` for page 0 and for pages past the last one. Page 1 always
/// exists, even for an empty directory.
///
/// ```
/// use gallery_library::page_breakdown;
/// let page = page_breakdown(2, 35, 30, 1).unwrap();
/// assert_eq!((page.directories, page.files, page.total_pages), (0..2, 0..28, 2));
/// let page = page_breakdown(2, 35, 30, 2).unwrap();
/// assert_eq!((page.directories, page.files), (2..2, 28..35));
/// assert!(page_breakdown(2, 35, 30, 3).is_none());
/// ```
pub fn page_breakdown(dir_count: usize, file_count: usize, page_size: usize, page: usize) -> Option<PageBreakdown> {
    let total = dir_count + file_count;
    let total_pages = total.div_ceil(page_size.max(1));
    if page == 0 || (page > total_pages && page != 1) {
        return None;
    }
    let start = (page - 1) * page_size;
    let end = (start + page_size).min(total);
    let start = start.min(end);
    Some(PageBreakdown {
        total_pages,
        directories: start.min(dir_count)..end.min(dir_count),
        files: start.saturating_sub(dir_count)..end.saturating_sub(dir_count),
    })
}

/// One page of a directory listing.
#[derive(Debug, Clone)]
pub struct Layout {
    pub directory: DirectoryRecord,
    pub sort: SortOrder,
    pub page: usize,
    pub page_size: usize,
    pub dir_count: usize,
    pub file_count: usize,
    pub total_pages: usize,
    pub directories: Vec<DirectoryRecord>,
    pub files: Vec<FileRecord>,
    /// Ids of the files on this page that still need a thumbnail rendered.
    pub missing_thumbnails: Vec<i64>,
    /// Tracking generation the listing was computed at.
    pub generation: i64,
}
impl Layout {
    pub fn key(&self) -> LayoutKey {
        LayoutKey { directory_id: self.directory.id, sort: self.sort, page: self.page }
    }

    pub fn len(&self) -> usize {
        self.directories.len() + self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live files of a directory with duplicate content removed.
#[derive(Debug, Clone)]
pub struct DistinctListing {
    pub directory_id: i64,
    pub sort: SortOrder,
    pub files: Vec<FileRecord>,
    pub generation: i64,
}

/// Keep the first file of each content hash, in order.
pub(crate) fn distinct_by_content(files: Vec<FileRecord>) -> Vec<FileRecord> {
    let mut seen = HashSet::new();
    files.into_iter().filter(|f| seen.insert(f.content_hash.clone())).collect()
}

pub struct LayoutManager {
    db: Database,
    caches: Arc<CacheRegistry>,
    page_size: usize,
}
impl LayoutManager {
    pub fn new(db: Database, caches: Arc<CacheRegistry>, page_size: usize) -> Self {
        Self { db, caches, page_size }
    }

    async fn generation(&self, directory_id: i64) -> Result<Option<i64>> {
        let entry = self.db.tracking().get(directory_id).await.or_raise(|| ErrorKind::Index)?;
        Ok(entry.map(|e| e.generation))
    }

    /// One page of `directory`, computed at tracking `generation`.
    ///
    /// A cached page is only served if it was computed at the same generation.
    /// A freshly computed page is only cached if no invalidation happened
    /// while it was being computed.
    #[tracing::instrument(level = "debug", skip(self, directory), fields(path = %directory.path.display()))]
    pub async fn page(&self, directory: &DirectoryRecord, sort: SortOrder, page: usize, generation: i64) -> Result<Arc<Layout>> {
        let key = LayoutKey { directory_id: directory.id, sort, page };
        if let Some(layout) = self.caches.layout(&key)
            && layout.generation == generation
        {
            return Ok(layout);
        }
        let directories = self.db.directories().children(directory.id, sort).await.or_raise(|| ErrorKind::Index)?;
        let files = self.db.files().children(directory.id, sort).await.or_raise(|| ErrorKind::Index)?;
        let (dir_count, file_count) = (directories.len(), files.len());
        let Some(breakdown) = page_breakdown(dir_count, file_count, self.page_size, page) else {
            let total = dir_count + file_count;
            exn::bail!(ErrorKind::PageOutOfRange { page, total: total.div_ceil(self.page_size.max(1)) });
        };
        let directories = directories[breakdown.directories].to_vec();
        let files = files[breakdown.files].to_vec();
        let ids: Vec<i64> = files.iter().map(|f| f.id).collect();
        let lacking = self.db.files().lacking_thumbnails(&ids).await.or_raise(|| ErrorKind::Index)?;
        let missing_thumbnails = ids.into_iter().filter(|id| lacking.contains(id)).collect();
        let layout = Arc::new(Layout {
            directory: directory.clone(),
            sort,
            page,
            page_size: self.page_size,
            dir_count,
            file_count,
            total_pages: breakdown.total_pages,
            directories,
            files,
            missing_thumbnails,
            generation,
        });
        if self.generation(directory.id).await? == Some(generation) {
            self.caches.insert_layout(Arc::clone(&layout));
        }
        Ok(layout)
    }

    /// Files of `directory` deduplicated by content, first occurrence wins.
    pub async fn distinct(&self, directory: &DirectoryRecord, sort: SortOrder, generation: i64) -> Result<Arc<DistinctListing>> {
        if let Some(listing) = self.caches.distinct(directory.id, sort)
            && listing.generation == generation
        {
            return Ok(listing);
        }
        let files = self.db.files().children(directory.id, sort).await.or_raise(|| ErrorKind::Index)?;
        let listing = Arc::new(DistinctListing {
            directory_id: directory.id,
            sort,
            files: distinct_by_content(files),
            generation,
        });
        if self.generation(directory.id).await? == Some(generation) {
            self.caches.insert_distinct(Arc::clone(&listing));
        }
        Ok(listing)
    }

    /// Previous and next directory among the parent's subdirectories, by name.
    pub async fn siblings(&self, directory: &DirectoryRecord) -> Result<(Option<DirectoryRecord>, Option<DirectoryRecord>)> {
        self.db.directories().siblings(directory).await.or_raise(|| ErrorKind::Index)
    }
}
