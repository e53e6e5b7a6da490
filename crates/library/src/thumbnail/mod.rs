//! Content-addressed thumbnails.
//!
//! Rendered bytes are stored per content hash, so every copy of the same
//! file shares one record and is rendered once. Pixels come from an external
//! [`Renderer`]; this module only decides when to call it and where the
//! result goes. A file that fails to render is flagged `generic_icon` and
//! served its filetype icon until its content changes.

pub mod error;

use crate::cache::CacheRegistry;
use crate::error::{ErrorKind as LibraryErrorKind, Result as LibraryResult};
use crate::thumbnail::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use gallery_index::filetype::{FileKind, FileTypes};
use gallery_index::hash::archive_member_key;
use gallery_index::{Database, DirectoryRecord, FileRecord, SortOrder, Tier};
use gallery_storage::BackendHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Produces thumbnail bytes from source bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, kind: FileKind, source: &[u8], tier: Tier) -> Result<Vec<u8>>;
}

/// Reads members of archive files.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    /// Paths of every member, in any order.
    async fn members(&self, archive: &[u8]) -> Result<Vec<String>>;
    async fn extract(&self, archive: &[u8], member: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Thumbnail {
    Bytes(Vec<u8>),
    /// Serve this static icon instead.
    Fallback { icon: String },
}

/// One async lock per key; unused entries are dropped on the next lookup.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}
impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct ThumbnailStore {
    db: Database,
    backend: BackendHandle,
    filetypes: Arc<FileTypes>,
    caches: Arc<CacheRegistry>,
    renderer: Arc<dyn Renderer>,
    archives: Option<Arc<dyn ArchiveReader>>,
    cover_names: Vec<String>,
    locks: KeyedLocks,
}
impl ThumbnailStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        backend: BackendHandle,
        filetypes: Arc<FileTypes>,
        caches: Arc<CacheRegistry>,
        renderer: Arc<dyn Renderer>,
        archives: Option<Arc<dyn ArchiveReader>>,
        cover_names: Vec<String>,
    ) -> Self {
        Self { db, backend, filetypes, caches, renderer, archives, cover_names, locks: KeyedLocks::default() }
    }

    /// Thumbnail of a file, rendering it on first request.
    ///
    /// Never fails because of the content itself: unrenderable files get a
    /// [`Thumbnail::Fallback`].
    pub async fn thumbnail(&self, file: &FileRecord, tier: Tier) -> LibraryResult<Thumbnail> {
        self.thumbnail_inner(file, tier).await.or_raise(|| LibraryErrorKind::Thumbnail)
    }

    async fn thumbnail_inner(&self, file: &FileRecord, tier: Tier) -> Result<Thumbnail> {
        let filetype = self.filetypes.get(&file.filetype);
        let fallback = Thumbnail::Fallback { icon: filetype.icon.clone() };
        if file.generic_icon || !filetype.is_thumbnailable() {
            return Ok(fallback);
        }
        // New copies of content that already failed start unflagged.
        if self.db.files().content_is_generic(&file.content_hash).await.or_raise(|| ErrorKind::Index)? {
            let directories =
                self.db.files().set_generic_icon(&file.content_hash, true).await.or_raise(|| ErrorKind::Index)?;
            self.caches.purge_directories(&directories);
            return Ok(fallback);
        }
        match self.render_cached(file, tier).await {
            Ok(bytes) => Ok(Thumbnail::Bytes(bytes)),
            Err(e) if e.is_content_failure() => {
                tracing::warn!(path = %file.path.display(), error = ?e, "Thumbnail failed; using generic icon");
                let directories =
                    self.db.files().set_generic_icon(&file.content_hash, true).await.or_raise(|| ErrorKind::Index)?;
                self.caches.purge_directories(&directories);
                Ok(fallback)
            },
            Err(e) if matches!(&*e, ErrorKind::Changed) => {
                tracing::info!(path = %file.path.display(), "Thumbnail source changed; invalidating its directory");
                let directories =
                    self.db.tracking().invalidate(file.directory_id).await.or_raise(|| ErrorKind::Index)?;
                self.caches.purge_directories(&directories);
                Ok(fallback)
            },
            Err(e) if matches!(&*e, ErrorKind::Storage) => {
                tracing::warn!(path = %file.path.display(), error = ?e, "Could not read thumbnail source");
                Ok(fallback)
            },
            Err(e) => Err(e),
        }
    }

    /// Stored bytes of a tier, unless missing or rendered from a source of another size.
    async fn stored(&self, key: &str, source_size: u64, tier: Tier) -> Result<Option<Vec<u8>>> {
        let record = self.db.thumbnails().get(key).await.or_raise(|| ErrorKind::Index)?;
        Ok(record.filter(|r| r.source_size == source_size).and_then(|r| r.tier(tier).map(<[u8]>::to_vec)))
    }

    /// Storage key of a file's thumbnail, if known without reading the file.
    fn known_key(&self, file: &FileRecord) -> Result<Option<String>> {
        if file.kind != FileKind::Archive {
            return Ok(Some(file.content_hash.clone()));
        }
        match self.caches.archive_cover(&file.content_hash) {
            Some(Some(member)) => Ok(Some(archive_member_key(&file.content_hash, &member))),
            Some(None) => exn::bail!(ErrorKind::NoCover),
            None => Ok(None),
        }
    }

    async fn render_cached(&self, file: &FileRecord, tier: Tier) -> Result<Vec<u8>> {
        if let Some(key) = self.known_key(file)?
            && let Some(bytes) = self.stored(&key, file.size, tier).await?
        {
            return Ok(bytes);
        }
        let _guard = self.locks.lock(&file.content_hash).await;
        // Someone else may have rendered it while we waited.
        if let Some(key) = self.known_key(file)?
            && let Some(bytes) = self.stored(&key, file.size, tier).await?
        {
            return Ok(bytes);
        }

        let source = self.backend.read(&file.path).await.or_raise(|| ErrorKind::Storage)?;
        if source.len() as u64 != file.size {
            exn::bail!(ErrorKind::Changed);
        }
        let (key, bytes) = match file.kind {
            FileKind::Archive => {
                let (archives, member) = self.archive_cover(file, &source).await?;
                let key = archive_member_key(&file.content_hash, &member);
                if let Some(bytes) = self.stored(&key, file.size, tier).await? {
                    return Ok(bytes);
                }
                let image = archives.extract(&source, &member).await?;
                (key, self.renderer.render(FileKind::Image, &image, tier).await?)
            },
            kind => (file.content_hash.clone(), self.renderer.render(kind, &source, tier).await?),
        };
        if bytes.is_empty() {
            exn::bail!(ErrorKind::Render(format!("empty {tier} thumbnail")));
        }
        tracing::debug!(path = %file.path.display(), %tier, "Rendered thumbnail");
        self.db
            .thumbnails()
            .store(&key, &file.content_hash, file.size, tier, &bytes)
            .await
            .or_raise(|| ErrorKind::Index)?;
        let directories =
            self.db.files().directories_with_content(&file.content_hash).await.or_raise(|| ErrorKind::Index)?;
        self.caches.purge_layouts(&directories);
        Ok(bytes)
    }

    /// First image member of an archive, by name.
    async fn archive_cover(&self, file: &FileRecord, source: &[u8]) -> Result<(&Arc<dyn ArchiveReader>, String)> {
        let archives =
            self.archives.as_ref().ok_or_raise(|| ErrorKind::Render("no archive reader configured".to_string()))?;
        let mut members = archives.members(source).await?;
        members.sort();
        let member = members.into_iter().find(|m| self.filetypes.classify(m).kind == FileKind::Image);
        self.caches.insert_archive_cover(&file.content_hash, member.clone());
        let member = member.ok_or_raise(|| ErrorKind::NoCover)?;
        Ok((archives, member))
    }

    /// Thumbnail of a directory's cover file.
    ///
    /// The cover is elected on first request and remembered until the
    /// directory is invalidated. A directory without any candidate gets the
    /// folder icon.
    pub async fn directory_thumbnail(&self, directory: &DirectoryRecord, tier: Tier) -> LibraryResult<Thumbnail> {
        self.directory_thumbnail_inner(directory, tier).await.or_raise(|| LibraryErrorKind::Thumbnail)
    }

    async fn directory_thumbnail_inner(&self, directory: &DirectoryRecord, tier: Tier) -> Result<Thumbnail> {
        let folder = Thumbnail::Fallback { icon: self.filetypes.directory().icon.clone() };
        if directory.generic_icon {
            return Ok(folder);
        }
        let mut touched = vec![directory.id];
        touched.extend(directory.parent_id);
        let directories = self.db.directories();

        let current = match directory.cover_file_id {
            Some(id) => self.db.files().get(id).await.or_raise(|| ErrorKind::Index)?,
            None => None,
        };
        let cover = match current.filter(|f| !f.delete_pending && !f.generic_icon) {
            Some(cover) => Some(cover),
            None => self.elect_cover(directory).await?,
        };
        let Some(cover) = cover else {
            directories.set_generic_icon(directory.id, true).await.or_raise(|| ErrorKind::Index)?;
            self.caches.purge_directories(&touched);
            return Ok(folder);
        };
        if directory.cover_file_id != Some(cover.id) {
            directories.set_cover(directory.id, Some(cover.id)).await.or_raise(|| ErrorKind::Index)?;
            self.caches.purge_directories(&touched);
        }
        match self.thumbnail_inner(&cover, tier).await? {
            Thumbnail::Bytes(bytes) => Ok(Thumbnail::Bytes(bytes)),
            Thumbnail::Fallback { .. } => {
                // Elect another one next time.
                directories.set_cover(directory.id, None).await.or_raise(|| ErrorKind::Index)?;
                self.caches.purge_directories(&touched);
                Ok(folder)
            },
        }
    }

    /// A file named like one of the cover names, else the first thumbnailable file.
    async fn elect_cover(&self, directory: &DirectoryRecord) -> Result<Option<FileRecord>> {
        let files = self.db.files().children(directory.id, SortOrder::Name).await.or_raise(|| ErrorKind::Index)?;
        let candidates: Vec<FileRecord> = files
            .into_iter()
            .filter(|f| !f.generic_icon && self.filetypes.get(&f.filetype).is_thumbnailable())
            .collect();
        let preferred = self
            .cover_names
            .iter()
            .find_map(|name| candidates.iter().position(|f| f.stem().eq_ignore_ascii_case(name)));
        let index = preferred.unwrap_or(0);
        Ok(candidates.into_iter().nth(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::Invalidator;
    use crate::scan::{EntryFilter, Scanner};
    use gallery_config::{CacheConfig, LibraryConfig};
    use gallery_storage::backend::MockBackend;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRenderer {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl Renderer for CountingRenderer {
        async fn render(&self, _kind: FileKind, source: &[u8], tier: Tier) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if source.starts_with(b"broken") {
                exn::bail!(ErrorKind::Render("corrupt image".to_string()));
            }
            Ok(format!("{tier}:{}", String::from_utf8_lossy(source)).into_bytes())
        }
    }

    /// Archives are `member=bytes` lines.
    struct LineArchive;
    #[async_trait]
    impl ArchiveReader for LineArchive {
        async fn members(&self, archive: &[u8]) -> Result<Vec<String>> {
            let text = String::from_utf8_lossy(archive);
            Ok(text.lines().filter_map(|l| l.split_once('=')).map(|(m, _)| m.to_string()).collect())
        }

        async fn extract(&self, archive: &[u8], member: &str) -> Result<Vec<u8>> {
            let text = String::from_utf8_lossy(archive);
            text.lines()
                .filter_map(|l| l.split_once('='))
                .find(|(m, _)| *m == member)
                .map(|(_, bytes)| bytes.as_bytes().to_vec())
                .ok_or_raise(|| ErrorKind::Render(format!("no member {member}")))
        }
    }

    struct Fixture {
        db: Database,
        backend: Arc<MockBackend>,
        scanner: Scanner,
        renderer: Arc<CountingRenderer>,
        store: ThumbnailStore,
    }

    async fn fixture(files: &[(&str, &str)]) -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let backend = Arc::new(MockBackend::with_files("/albums", files.iter().map(|(p, b)| (*p, b.as_bytes().to_vec()))));
        let caches = Arc::new(CacheRegistry::new(&CacheConfig::default()));
        let filetypes = Arc::new(FileTypes::load(&db).await.unwrap());
        let config = LibraryConfig::default();
        let scanner = Scanner::new(
            db.clone(),
            backend.clone(),
            Arc::clone(&filetypes),
            Arc::clone(&caches),
            Invalidator::new(db.clone(), Arc::clone(&caches)),
            EntryFilter::new(&config),
            PathBuf::from("/albums"),
            2,
        );
        scanner.scan("/albums", false).await.unwrap();
        let renderer = Arc::new(CountingRenderer::default());
        let store = ThumbnailStore::new(
            db.clone(),
            backend.clone(),
            filetypes,
            caches,
            renderer.clone(),
            Some(Arc::new(LineArchive)),
            config.cover_names,
        );
        Fixture { db, backend, scanner, renderer, store }
    }

    impl Fixture {
        async fn file(&self, path: &str) -> FileRecord {
            self.db.files().get_by_path(path).await.unwrap().unwrap()
        }

        async fn root(&self) -> DirectoryRecord {
            self.db.directories().get_by_path("/albums").await.unwrap().unwrap()
        }

        fn renders(&self) -> usize {
            self.renderer.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_duplicates_share_one_render() {
        let f = fixture(&[("/albums/a.jpg", "same"), ("/albums/b.jpg", "same")]).await;
        let a = f.store.thumbnail(&f.file("/albums/a.jpg").await, Tier::Small).await.unwrap();
        let b = f.store.thumbnail(&f.file("/albums/b.jpg").await, Tier::Small).await.unwrap();
        assert_eq!(a, Thumbnail::Bytes(b"small:same".to_vec()));
        assert_eq!(a, b);
        assert_eq!(f.renders(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_render_once() {
        let f = fixture(&[("/albums/a.jpg", "same")]).await;
        let file = f.file("/albums/a.jpg").await;
        let (a, b) = tokio::join!(f.store.thumbnail(&file, Tier::Medium), f.store.thumbnail(&file, Tier::Medium));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.renders(), 1);
    }

    #[tokio::test]
    async fn test_thumbnail_of_another_size_is_rerendered() {
        let f = fixture(&[("/albums/a.jpg", "old")]).await;
        let file = f.file("/albums/a.jpg").await;
        f.db.thumbnails().store(&file.content_hash, &file.content_hash, file.size + 1, Tier::Small, b"stale").await.unwrap();
        let thumbnail = f.store.thumbnail(&file, Tier::Small).await.unwrap();
        assert_eq!(thumbnail, Thumbnail::Bytes(b"small:old".to_vec()));
        assert_eq!(f.renders(), 1);
        assert_eq!(f.db.thumbnails().get(&file.content_hash).await.unwrap().unwrap().source_size, file.size);
    }

    #[tokio::test]
    async fn test_changed_source_is_not_stored_under_the_old_hash() {
        let f = fixture(&[("/albums/a.jpg", "old")]).await;
        let file = f.file("/albums/a.jpg").await;
        assert!(f.db.tracking().is_valid(file.directory_id).await.unwrap());
        f.backend.write("/albums/a.jpg", b"changed".to_vec()).await;

        let thumbnail = f.store.thumbnail(&file, Tier::Small).await.unwrap();
        assert!(matches!(thumbnail, Thumbnail::Fallback { .. }));
        assert_eq!(f.renders(), 0);
        assert!(f.db.thumbnails().get(&file.content_hash).await.unwrap().is_none());
        assert!(!f.file("/albums/a.jpg").await.generic_icon);
        assert!(!f.db.tracking().is_valid(file.directory_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_render_failure_falls_back_and_is_remembered() {
        let f = fixture(&[("/albums/a.jpg", "broken")]).await;
        let thumbnail = f.store.thumbnail(&f.file("/albums/a.jpg").await, Tier::Small).await.unwrap();
        assert!(matches!(thumbnail, Thumbnail::Fallback { .. }));
        let file = f.file("/albums/a.jpg").await;
        assert!(file.generic_icon);
        f.store.thumbnail(&file, Tier::Small).await.unwrap();
        assert_eq!(f.renders(), 1);
    }

    #[tokio::test]
    async fn test_new_copy_of_failed_content_is_not_rendered() {
        let f = fixture(&[("/albums/a.jpg", "broken")]).await;
        f.store.thumbnail(&f.file("/albums/a.jpg").await, Tier::Small).await.unwrap();
        f.backend.write("/albums/copy.jpg", b"broken".to_vec()).await;
        f.scanner.scan("/albums", true).await.unwrap();

        let copy = f.file("/albums/copy.jpg").await;
        let thumbnail = f.store.thumbnail(&copy, Tier::Small).await.unwrap();
        assert!(matches!(thumbnail, Thumbnail::Fallback { .. }));
        assert_eq!(f.renders(), 1);
        assert!(f.file("/albums/copy.jpg").await.generic_icon);
    }

    #[tokio::test]
    async fn test_generic_filetypes_are_not_rendered() {
        let f = fixture(&[("/albums/notes.txt", "hello")]).await;
        let thumbnail = f.store.thumbnail(&f.file("/albums/notes.txt").await, Tier::Small).await.unwrap();
        assert!(matches!(thumbnail, Thumbnail::Fallback { .. }));
        assert_eq!(f.renders(), 0);
    }

    #[tokio::test]
    async fn test_archive_cover_is_first_image_member() {
        let f = fixture(&[("/albums/comic.cbz", "readme.txt=hi\n02.jpg=second\n01.jpg=first")]).await;
        let archive = f.file("/albums/comic.cbz").await;
        let thumbnail = f.store.thumbnail(&archive, Tier::Small).await.unwrap();
        assert_eq!(thumbnail, Thumbnail::Bytes(b"small:first".to_vec()));
        let key = archive_member_key(&archive.content_hash, "01.jpg");
        let record = f.db.thumbnails().get(&key).await.unwrap().unwrap();
        assert_eq!(record.source_hash, archive.content_hash);
        // Served from the index now.
        f.store.thumbnail(&archive, Tier::Small).await.unwrap();
        assert_eq!(f.renders(), 1);
    }

    #[tokio::test]
    async fn test_archive_without_images_is_generic() {
        let f = fixture(&[("/albums/docs.zip", "readme.txt=hi")]).await;
        let thumbnail = f.store.thumbnail(&f.file("/albums/docs.zip").await, Tier::Small).await.unwrap();
        assert!(matches!(thumbnail, Thumbnail::Fallback { .. }));
        assert!(f.file("/albums/docs.zip").await.generic_icon);
    }

    #[tokio::test]
    async fn test_directory_cover_prefers_cover_names() {
        let f = fixture(&[("/albums/a.jpg", "a"), ("/albums/Folder.png", "folder"), ("/albums/z.jpg", "z")]).await;
        let thumbnail = f.store.directory_thumbnail(&f.root().await, Tier::Small).await.unwrap();
        assert_eq!(thumbnail, Thumbnail::Bytes(b"small:folder".to_vec()));
        let root = f.root().await;
        assert_eq!(root.cover_file_id, Some(f.file("/albums/Folder.png").await.id));
    }

    #[tokio::test]
    async fn test_directory_cover_falls_back_to_first_file() {
        let f = fixture(&[("/albums/b.jpg", "b"), ("/albums/a.txt", "text"), ("/albums/c.jpg", "c")]).await;
        let thumbnail = f.store.directory_thumbnail(&f.root().await, Tier::Small).await.unwrap();
        assert_eq!(thumbnail, Thumbnail::Bytes(b"small:b".to_vec()));
    }

    #[tokio::test]
    async fn test_empty_directory_gets_folder_icon() {
        let f = fixture(&[("/albums/x/a.jpg", "a")]).await;
        let thumbnail = f.store.directory_thumbnail(&f.root().await, Tier::Small).await.unwrap();
        assert!(matches!(thumbnail, Thumbnail::Fallback { .. }));
        assert!(f.root().await.generic_icon);
        // Invalidation gives it another chance.
        f.db.tracking().invalidate(f.root().await.id).await.unwrap();
        assert!(!f.root().await.generic_icon);
    }
}
