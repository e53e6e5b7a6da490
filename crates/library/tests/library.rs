use async_trait::async_trait;
use gallery_config::Config;
use gallery_index::filetype::FileKind;
use gallery_index::{Database, SortOrder, Tier};
use gallery_library::error::ErrorKind;
use gallery_library::thumbnail::error::Result as RenderResult;
use gallery_library::{Library, Renderer, Thumbnail};
use gallery_storage::backend::{LocalBackend, MockBackend};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct EchoRenderer {
    calls: AtomicUsize,
}
#[async_trait]
impl Renderer for EchoRenderer {
    async fn render(&self, _kind: FileKind, source: &[u8], tier: Tier) -> RenderResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut thumbnail = format!("{tier}:").into_bytes();
        thumbnail.extend_from_slice(source);
        Ok(thumbnail)
    }
}

struct Fixture {
    library: Library,
    backend: Arc<MockBackend>,
    renderer: Arc<EchoRenderer>,
}
impl Fixture {
    async fn new(files: Vec<(String, String)>) -> Self {
        let db = Database::connect_in_memory().await.unwrap();
        let backend = Arc::new(MockBackend::with_files("/albums", files.into_iter().map(|(p, c)| (p, c.into_bytes()))));
        let mut config = Config::default();
        config.library.root = PathBuf::from("/albums");
        let renderer = Arc::new(EchoRenderer::default());
        let library = Library::with_database(db, &config, backend.clone(), renderer.clone(), None).await.unwrap();
        Self { library, backend, renderer }
    }

    async fn with(files: &[(&str, &str)]) -> Self {
        Self::new(files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect()).await
    }

    fn db(&self) -> &Database {
        self.library.database()
    }

    async fn total_changes(&self) -> i64 {
        sqlx::query_scalar("SELECT total_changes()").fetch_one(self.db().pool()).await.unwrap()
    }

    async fn is_valid(&self, path: &str) -> bool {
        let directory = self.db().directories().get_by_path(path).await.unwrap().unwrap();
        self.db().tracking().is_valid(directory.id).await.unwrap()
    }
}

#[tokio::test]
async fn test_second_scan_performs_no_writes() {
    let f = Fixture::with(&[("/albums/a.jpg", "a"), ("/albums/b.jpg", "b"), ("/albums/x/c.jpg", "c")]).await;
    let first = f.library.reconcile("/albums", false).await.unwrap();
    assert_eq!(first.created, 3);

    let before = f.total_changes().await;
    let second = f.library.reconcile("/albums", false).await.unwrap();
    assert!(second.fresh);
    assert_eq!(f.total_changes().await, before);

    // A forced rescan of an unchanged directory only records the scan itself.
    let forced = f.library.reconcile("/albums", true).await.unwrap();
    assert!(!forced.fresh);
    assert!(!forced.changed());
    assert_eq!(f.total_changes().await, before + 2);
}

#[tokio::test]
async fn test_content_hash_survives_rename() {
    let f = Fixture::with(&[("/albums/a.jpg", "pixels")]).await;
    let original = f.library.file("/albums/a.jpg").await.unwrap();

    f.backend.remove("/albums/a.jpg").await;
    f.backend.write("/albums/b.jpg", "pixels").await;
    f.library.invalidate("/albums").await.unwrap();

    let renamed = f.library.file("/albums/b.jpg").await.unwrap();
    assert_eq!(renamed.content_hash, original.content_hash);
    assert_ne!(renamed.unique_hash, original.unique_hash);
    let err = f.library.file("/albums/a.jpg").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::NotFound(_)));
}

#[tokio::test]
async fn test_leaf_invalidation_reaches_every_ancestor() {
    let f = Fixture::with(&[("/albums/x/y/z/a.jpg", "a")]).await;
    let levels = ["/albums", "/albums/x", "/albums/x/y", "/albums/x/y/z"];
    for path in levels {
        f.library.reconcile(path, false).await.unwrap();
        assert!(f.is_valid(path).await, "{path}");
    }
    let affected = f.library.invalidate("/albums/x/y/z").await.unwrap();
    assert_eq!(affected.len(), 4);
    for path in levels {
        assert!(!f.is_valid(path).await, "{path}");
    }
}

#[tokio::test]
async fn test_identical_files_share_one_thumbnail() {
    let f = Fixture::with(&[("/albums/a.jpg", "same"), ("/albums/b.jpg", "same")]).await;
    let a = f.library.thumbnail("/albums/a.jpg", Tier::Small).await.unwrap();
    let b = f.library.thumbnail("/albums/b.jpg", Tier::Small).await.unwrap();
    assert_eq!(a, Thumbnail::Bytes(b"small:same".to_vec()));
    assert_eq!(a, b);
    assert_eq!(f.renderer.calls.load(Ordering::SeqCst), 1);
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM thumbnails").fetch_one(f.db().pool()).await.unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_pagination_covers_every_child_once() {
    let mut files: Vec<(String, String)> = (0..35).map(|i| (format!("/albums/f{i:02}.jpg"), format!("file {i}"))).collect();
    files.push(("/albums/d1/a.jpg".to_string(), "d1".to_string()));
    files.push(("/albums/d2/a.jpg".to_string(), "d2".to_string()));
    let f = Fixture::new(files).await;

    let first = f.library.listing("/albums", SortOrder::Name, 1).await.unwrap();
    assert_eq!((first.dir_count, first.file_count, first.total_pages), (2, 35, 2));
    assert_eq!((first.directories.len(), first.files.len()), (2, 28));
    let second = f.library.listing("/albums", SortOrder::Name, 2).await.unwrap();
    assert_eq!((second.directories.len(), second.files.len()), (0, 7));
    assert_eq!(second.len(), 7);

    let names: Vec<&str> = [&first, &second]
        .into_iter()
        .flat_map(|page| {
            let directories = page.directories.iter().map(|d| d.name.as_str());
            directories.chain(page.files.iter().map(|f| f.name.as_str()))
        })
        .collect();
    let mut expected = vec!["d1".to_string(), "d2".to_string()];
    expected.extend((0..35).map(|i| format!("f{i:02}.jpg")));
    assert_eq!(names, expected);

    let err = f.library.listing("/albums", SortOrder::Name, 3).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::PageOutOfRange { page: 3, total: 2 }));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_empty_directory_has_one_empty_page() {
    let f = Fixture::with(&[]).await;
    let page = f.library.listing("/albums", SortOrder::Name, 1).await.unwrap();
    assert!(page.is_empty());
    assert_eq!(page.total_pages, 0);
}

#[tokio::test]
async fn test_removed_file_is_tombstoned_and_hidden() {
    let f = Fixture::with(&[("/albums/a.jpg", "a"), ("/albums/b.jpg", "b")]).await;
    let b = f.library.file("/albums/b.jpg").await.unwrap();
    f.backend.remove("/albums/b.jpg").await;
    f.library.invalidate("/albums/b.jpg").await.unwrap();

    let page = f.library.listing("/albums", SortOrder::Name, 1).await.unwrap();
    let names: Vec<&str> = page.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a.jpg"]);
    assert!(f.db().files().get(b.id).await.unwrap().unwrap().delete_pending);
    let distinct = f.library.distinct("/albums", SortOrder::Name).await.unwrap();
    assert_eq!(distinct.files.len(), 1);
}

#[tokio::test]
async fn test_listings_stay_cached_until_invalidated() {
    let f = Fixture::with(&[("/albums/a.jpg", "a")]).await;
    assert_eq!(f.library.listing("/albums", SortOrder::Name, 1).await.unwrap().file_count, 1);
    f.backend.write("/albums/b.jpg", "b").await;
    // Nothing reported the change yet.
    assert_eq!(f.library.listing("/albums", SortOrder::Name, 1).await.unwrap().file_count, 1);
    f.library.invalidate("/albums/b.jpg").await.unwrap();
    assert_eq!(f.library.listing("/albums", SortOrder::Name, 1).await.unwrap().file_count, 2);
}

#[tokio::test]
async fn test_changed_file_does_not_leak_into_duplicates() {
    let f = Fixture::with(&[("/albums/a.jpg", "old"), ("/albums/c.jpg", "old")]).await;
    f.library.reconcile("/albums", false).await.unwrap();
    f.backend.write("/albums/a.jpg", "changed").await;
    f.library.invalidate("/albums/a.jpg").await.unwrap();

    let a = f.library.thumbnail("/albums/a.jpg", Tier::Small).await.unwrap();
    assert_eq!(a, Thumbnail::Bytes(b"small:changed".to_vec()));
    let c = f.library.thumbnail("/albums/c.jpg", Tier::Small).await.unwrap();
    assert_eq!(c, Thumbnail::Bytes(b"small:old".to_vec()));
}

#[tokio::test]
async fn test_unreported_change_is_caught_before_rendering() {
    let f = Fixture::with(&[("/albums/a.jpg", "old"), ("/albums/c.jpg", "old")]).await;
    f.library.reconcile("/albums", false).await.unwrap();
    // Nothing reports this write, so the index still has the old record.
    f.backend.write("/albums/a.jpg", "changed").await;

    let a = f.library.thumbnail("/albums/a.jpg", Tier::Small).await.unwrap();
    assert!(matches!(a, Thumbnail::Fallback { .. }));
    assert!(!f.is_valid("/albums").await);
    let a = f.library.thumbnail("/albums/a.jpg", Tier::Small).await.unwrap();
    assert_eq!(a, Thumbnail::Bytes(b"small:changed".to_vec()));
    let c = f.library.thumbnail("/albums/c.jpg", Tier::Small).await.unwrap();
    assert_eq!(c, Thumbnail::Bytes(b"small:old".to_vec()));
}

#[tokio::test]
async fn test_skipped_entry_is_retried_on_next_read() {
    let f = Fixture::with(&[("/albums/a.jpg", "a")]).await;
    f.library.reconcile("/albums", false).await.unwrap();
    f.backend.write("/albums/b.jpg", "b").await;
    f.backend.deny("/albums/b.jpg").await;
    f.library.invalidate("/albums/b.jpg").await.unwrap();

    let page = f.library.listing("/albums", SortOrder::Name, 1).await.unwrap();
    assert_eq!(page.file_count, 1);
    assert!(!f.is_valid("/albums").await);

    f.backend.allow("/albums/b.jpg").await;
    let page = f.library.listing("/albums", SortOrder::Name, 1).await.unwrap();
    assert_eq!(page.file_count, 2);
    assert!(f.is_valid("/albums").await);
}

#[tokio::test]
async fn test_invalidate_by_directory_hash() {
    let f = Fixture::with(&[("/albums/x/a.jpg", "a")]).await;
    let x = f.library.add_directory("/albums/x").await.unwrap();
    f.library.reconcile("/albums", false).await.unwrap();
    let affected = f.library.invalidate_hash(&x.path_hash).await.unwrap();
    assert_eq!(affected.len(), 2);
    assert!(!f.is_valid("/albums/x").await);
    assert!(!f.is_valid("/albums").await);
    assert!(f.library.invalidate_hash("no-such-hash").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_directory_invalidates_its_ancestors() {
    let f = Fixture::with(&[("/albums/x/y/a.jpg", "a"), ("/albums/x/b.jpg", "b")]).await;
    for path in ["/albums", "/albums/x", "/albums/x/y"] {
        f.library.reconcile(path, false).await.unwrap();
    }
    f.backend.remove("/albums/x/y").await;
    // What a watcher reports for a removed subtree.
    let events = vec![PathBuf::from("/albums/x/y/a.jpg"), PathBuf::from("/albums/x/y")];
    f.library.invalidate_many(&events).await.unwrap();
    for path in ["/albums", "/albums/x", "/albums/x/y"] {
        assert!(!f.is_valid(path).await, "{path}");
    }

    let page = f.library.listing("/albums/x", SortOrder::Name, 1).await.unwrap();
    assert_eq!(page.dir_count, 0);
    let err = f.library.listing("/albums/x/y", SortOrder::Name, 1).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::NotFound(_)));
}

#[tokio::test]
async fn test_directory_thumbnail_uses_cover_file() {
    let f = Fixture::with(&[("/albums/x/b.jpg", "b"), ("/albums/x/cover.jpg", "cover")]).await;
    let thumbnail = f.library.directory_thumbnail("/albums/x", Tier::Medium).await.unwrap();
    assert_eq!(thumbnail, Thumbnail::Bytes(b"medium:cover".to_vec()));
    let directory = f.library.directory("/albums/x").await.unwrap();
    let cover = f.library.file("/albums/x/cover.jpg").await.unwrap();
    assert_eq!(directory.cover_file_id, Some(cover.id));
}

#[tokio::test]
async fn test_siblings_by_name() {
    let f = Fixture::with(&[("/albums/a/1.jpg", "1"), ("/albums/b/2.jpg", "2"), ("/albums/c/3.jpg", "3")]).await;
    f.library.reconcile("/albums", false).await.unwrap();
    let (previous, next) = f.library.siblings("/albums/b").await.unwrap();
    assert_eq!(previous.map(|d| d.name), Some("a".to_string()));
    assert_eq!(next.map(|d| d.name), Some("c".to_string()));
}

#[tokio::test]
async fn test_outside_root_is_not_found() {
    let f = Fixture::with(&[("/albums/a.jpg", "a")]).await;
    let err = f.library.directory("/elsewhere").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::NotFound(_)));
    let err = f.library.file("/albums/missing.jpg").await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::NotFound(_)));
}

#[tokio::test]
async fn test_purge_removes_tombstones() {
    let f = Fixture::with(&[("/albums/x/a.jpg", "a"), ("/albums/b.jpg", "b")]).await;
    f.library.reconcile("/albums/x", false).await.unwrap();
    f.library.thumbnail("/albums/x/a.jpg", Tier::Small).await.unwrap();
    f.backend.remove("/albums/x").await;
    f.library.invalidate("/albums/x").await.unwrap();
    f.library.reconcile("/albums", false).await.unwrap();

    let report = f.library.purge_tombstones().await.unwrap();
    assert_eq!((report.directories, report.files), (1, 1));
    assert_eq!(f.library.purge_orphaned_thumbnails().await.unwrap(), 1);
}

#[tokio::test]
async fn test_local_filesystem() {
    let library_dir = tempfile::tempdir().unwrap();
    let index_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(library_dir.path().join("x")).unwrap();
    std::fs::write(library_dir.path().join("x/a.jpg"), b"pixels").unwrap();
    std::fs::write(library_dir.path().join("Thumbs.db"), b"junk").unwrap();

    let mut config = Config::default();
    config.library.root = library_dir.path().to_path_buf();
    config.database.path = index_dir.path().join("index.db");
    let backend = Arc::new(LocalBackend::new("test", library_dir.path()).unwrap());
    let library = Library::open(&config, backend, Arc::new(EchoRenderer::default()), None).await.unwrap();

    let root = library.listing(library_dir.path(), SortOrder::Name, 1).await.unwrap();
    assert_eq!((root.dir_count, root.file_count), (1, 0));
    let file = library.file(library_dir.path().join("x/a.jpg")).await.unwrap();
    assert_eq!(file.size, 6);
    let thumbnail = library.thumbnail(&file.path, Tier::Large).await.unwrap();
    assert_eq!(thumbnail, Thumbnail::Bytes(b"large:pixels".to_vec()));
}
