//! In-memory storage backend for testing.

use super::{BoxSyncRead, EntryStream};
use crate::error::{ErrorKind, Result};
use crate::path::{normalize, within};
use crate::{Entry, EntryKind, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use time::UtcDateTime;
use tokio::sync::RwLock;

#[derive(Clone)]
enum Node {
    File(UtcDateTime, Vec<u8>),
    Directory(UtcDateTime),
    Link(PathBuf),
}

/// In-memory storage backend for testing.
///
/// The tree is a map of absolute paths behind a [`RwLock`]; parent
/// directories are created implicitly, and every mutation bumps the parent
/// directory's modification time the same way a real filesystem would.
///
/// # Examples
///
/// ```
/// use gallery_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files("/albums", [
///     ("/albums/x/a.jpg", b"jpeg"),
/// ]);
/// assert!(backend.exists(Path::new("/albums/x")).await?);
/// assert_eq!(backend.list(Path::new("/albums/x")).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    root: PathBuf,
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
    denied: RwLock<HashSet<PathBuf>>,
    reads: AtomicUsize,
}

impl MockBackend {
    /// Create an empty mock library rooted at `root`.
    ///
    /// Panics if `root` is not absolute. If test setup is wrong, then test
    /// should not pass.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let Ok(root) = normalize(root.as_ref()) else {
            panic!("MockBackend::new: invalid root {}", root.as_ref().display());
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(root.clone(), Node::Directory(UtcDateTime::now()));
        Self {
            name: "mock".to_string(),
            root,
            nodes: RwLock::new(nodes),
            denied: RwLock::new(HashSet::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path is outside of `root`.
    pub fn with_files(
        root: impl AsRef<Path>,
        files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>,
    ) -> Self {
        let backend = Self::new(root);
        {
            let mut nodes = backend.nodes.try_write().expect("freshly created lock");
            let now = UtcDateTime::now();
            for (path, data) in files {
                let path = backend.validated(path.into());
                Self::insert(&mut nodes, &backend.root, path, Node::File(now, data.into()), now);
            }
        }
        backend
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn validated(&self, path: PathBuf) -> PathBuf {
        match within(&self.root, &path) {
            Ok(path) => path,
            // The panic here is DELIBERATE. MockBackend is intended to be
            // used in tests; panics are expected. There is no error result.
            Err(_) => panic!("MockBackend: invalid path {}", path.display()),
        }
    }

    fn insert(nodes: &mut BTreeMap<PathBuf, Node>, root: &Path, path: PathBuf, node: Node, now: UtcDateTime) {
        let mut ancestor = path.parent();
        while let Some(dir) = ancestor
            && dir.starts_with(root)
        {
            match nodes.get_mut(dir) {
                Some(Node::Directory(modified)) => *modified = now,
                _ => {
                    nodes.insert(dir.to_path_buf(), Node::Directory(now));
                },
            }
            ancestor = dir.parent();
        }
        nodes.insert(path, node);
    }

    /// Write (or overwrite) a file, creating parent directories.
    pub async fn write(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.write_at(path, data, UtcDateTime::now()).await
    }

    /// Write a file with an explicit modification time.
    pub async fn write_at(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>, modified: UtcDateTime) {
        let path = self.validated(path.into());
        let mut nodes = self.nodes.write().await;
        Self::insert(&mut nodes, &self.root, path, Node::File(modified, data.into()), UtcDateTime::now());
    }

    /// Create a directory (and its parents).
    pub async fn mkdir(&self, path: impl Into<PathBuf>) {
        let path = self.validated(path.into());
        let now = UtcDateTime::now();
        let mut nodes = self.nodes.write().await;
        Self::insert(&mut nodes, &self.root, path, Node::Directory(now), now);
    }

    /// Create a symlink at `path` pointing to `target`.
    pub async fn symlink(&self, path: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        let path = self.validated(path.into());
        let Ok(target) = normalize(target.into()) else {
            panic!("MockBackend::symlink: invalid target");
        };
        let mut nodes = self.nodes.write().await;
        Self::insert(&mut nodes, &self.root, path, Node::Link(target), UtcDateTime::now());
    }

    /// Remove a file or a whole directory subtree.
    pub async fn remove(&self, path: impl Into<PathBuf>) {
        let path = self.validated(path.into());
        let mut nodes = self.nodes.write().await;
        nodes.retain(|p, _| !p.starts_with(&path));
        if let Some(parent) = path.parent()
            && let Some(Node::Directory(modified)) = nodes.get_mut(parent)
        {
            *modified = UtcDateTime::now();
        }
    }

    /// Make `stat`/`read` on a path fail with `PermissionDenied`.
    pub async fn deny(&self, path: impl Into<PathBuf>) {
        let path = self.validated(path.into());
        self.denied.write().await.insert(path);
    }

    /// Undo [`MockBackend::deny`].
    pub async fn allow(&self, path: impl Into<PathBuf>) {
        let path = self.validated(path.into());
        self.denied.write().await.remove(&path);
    }

    /// Number of file reads (whole or streaming) performed so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    async fn check_denied(&self, path: &Path) -> Result<()> {
        match self.denied.read().await.contains(path) {
            true => exn::bail!(ErrorKind::PermissionDenied(path.to_path_buf())),
            false => Ok(()),
        }
    }

    async fn entry(&self, path: &Path) -> Result<Entry> {
        self.check_denied(path).await?;
        let nodes = self.nodes.read().await;
        let node = nodes.get(path).ok_or_else(|| ErrorKind::NotFound(path.to_path_buf()))?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("/").to_string();
        Ok(match node {
            Node::File(modified, data) => Entry::new(path, name, EntryKind::File, data.len() as u64, *modified),
            Node::Directory(modified) => Entry::new(path, name, EntryKind::Directory, 0, *modified),
            Node::Link(target) => match nodes.get(target) {
                Some(Node::Directory(modified)) => {
                    Entry::new(path, name, EntryKind::DirectoryLink(target.clone()), 0, *modified)
                },
                Some(Node::File(modified, data)) => {
                    Entry::new(path, name, EntryKind::File, data.len() as u64, *modified)
                },
                _ => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            },
        })
    }

    async fn data(&self, path: &Path) -> Result<Vec<u8>> {
        let path = within(&self.root, path)?;
        self.check_denied(&path).await?;
        let nodes = self.nodes.read().await;
        let resolved = match nodes.get(&path) {
            Some(Node::Link(target)) => target.clone(),
            _ => path.clone(),
        };
        match nodes.get(&resolved) {
            Some(Node::File(_, data)) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(data.clone())
            },
            Some(_) => exn::bail!(ErrorKind::BackendError(format!("`{}` is not a file", path.display()))),
            None => exn::bail!(ErrorKind::NotFound(path)),
        }
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list_stream<'a>(&'a self, dir: &'a Path) -> EntryStream<'a> {
        let dir = match within(&self.root, dir) {
            Ok(dir) => dir,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            if let Err(e) = self.check_denied(&dir).await {
                yield Err(e);
                return;
            }
            // Snapshot the children under the read lock, then drop it before
            // yielding to avoid holding the lock across yield points.
            let children: Result<Vec<PathBuf>> = {
                let nodes = self.nodes.read().await;
                match nodes.get(&dir) {
                    Some(Node::Directory(_)) => Ok(nodes
                        .keys()
                        .filter(|p| p.parent() == Some(dir.as_path()))
                        .cloned()
                        .collect()),
                    Some(_) => Err(exn::Exn::from(ErrorKind::NotADirectory(dir.clone()))),
                    None => Err(exn::Exn::from(ErrorKind::NotFound(dir.clone()))),
                }
            };
            match children {
                Ok(children) => for child in children {
                    yield self.entry(&child).await;
                },
                Err(e) => yield Err(e),
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = within(&self.root, path)?;
        Ok(self.nodes.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.data(path).await
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        Ok(Box::new(Cursor::new(self.data(path).await?)))
    }

    async fn stat(&self, path: &Path) -> Result<Entry> {
        let path = within(&self.root, path)?;
        self.entry(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_with_files_creates_parents() {
        let backend = MockBackend::with_files("/albums", [("/albums/x/y/a.jpg", b"a".to_vec())]);
        assert!(backend.exists(Path::new("/albums/x")).await.unwrap());
        assert!(backend.stat(Path::new("/albums/x/y")).await.unwrap().is_dir());
        let listing = backend.list(Path::new("/albums/x")).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "y");
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let backend = MockBackend::with_files("/albums", [
            ("/albums/x/y/a.jpg", b"a".to_vec()),
            ("/albums/x/b.jpg", b"b".to_vec()),
        ]);
        backend.remove("/albums/x/y").await;
        assert!(!backend.exists(Path::new("/albums/x/y/a.jpg")).await.unwrap());
        assert_eq!(backend.list(Path::new("/albums/x")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_entry_is_isolated() {
        let backend = MockBackend::with_files("/albums", [
            ("/albums/a.jpg", b"a".to_vec()),
            ("/albums/b.jpg", b"b".to_vec()),
        ]);
        backend.deny("/albums/a.jpg").await;
        let results: Vec<_> = backend.list_stream(Path::new("/albums")).collect().await;
        assert_eq!(results.len(), 2);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(&**err, ErrorKind::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let backend = MockBackend::new("/albums");
        let results: Vec<_> = backend.list_stream(Path::new("/albums/nope")).collect().await;
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(&**err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reads_are_counted() {
        let backend = MockBackend::with_files("/albums", [("/albums/a.jpg", b"a".to_vec())]);
        backend.read(Path::new("/albums/a.jpg")).await.unwrap();
        backend.reader(Path::new("/albums/a.jpg")).await.unwrap();
        assert_eq!(backend.reads(), 2);
    }

    #[tokio::test]
    async fn test_directory_link() {
        let backend = MockBackend::new("/albums");
        backend.mkdir("/albums/real").await;
        backend.symlink("/albums/alias", "/albums/real").await;
        let entry = backend.stat(Path::new("/albums/alias")).await.unwrap();
        assert_eq!(entry.kind, EntryKind::DirectoryLink(PathBuf::from("/albums/real")));
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files("/albums", [("/elsewhere/escape", b"bad".to_vec())]);
    }
}
