//! Local filesystem storage backend.
//!
//! Entries are read with `tokio::fs`. The library root is an existing media
//! tree that this crate never writes to, so unlike a managed store the
//! backend refuses to start on a missing root instead of creating one.

use crate::backend::{BoxSyncRead, EntryStream};
use crate::error::{ErrorKind, Result};
use crate::path::{normalize, within};
use crate::{Entry, EntryKind, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::fs;

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use gallery_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("albums", "/srv/media/albums")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for the library
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, does not exist, or is
    /// not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = normalize(root.as_ref())?;
        // Use non-async here; it'll only happen once on library initialization
        // and it's not worth the hassle of making the constructor async.
        let metadata = std::fs::metadata(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::NotADirectory(root));
        }
        Ok(Self { name: name.into(), root })
    }

    fn checked(&self, path: &Path) -> Result<PathBuf> {
        within(&self.root, path)
    }

    fn modified(metadata: &Metadata, path: &Path) -> Result<UtcDateTime> {
        let modified = metadata.modified().map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(UtcDateTime::from(modified))
    }

    fn name_of(path: &Path) -> Result<String> {
        match path.file_name() {
            Some(name) => Ok(name.to_str().ok_or_else(|| ErrorKind::InvalidPath(path.to_path_buf()))?.to_string()),
            // Only the filesystem root has no final component.
            None => Ok("/".to_string()),
        }
    }

    /// Build an [`Entry`] for an already-validated absolute path.
    ///
    /// Symlinks are followed once: a link to a file is reported as the file,
    /// a link to a directory is reported as [`EntryKind::DirectoryLink`] so
    /// the scanner never descends through it. Dangling links are `NotFound`.
    async fn entry(&self, path: PathBuf) -> Result<Entry> {
        let name = Self::name_of(&path)?;
        let link = fs::symlink_metadata(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?;
        let metadata = match link.file_type().is_symlink() {
            true => fs::metadata(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?,
            false => link.clone(),
        };
        let modified = Self::modified(&metadata, &path)?;
        if link.file_type().is_symlink() && metadata.is_dir() {
            let target = fs::canonicalize(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?;
            return Ok(Entry::new(path, name, EntryKind::DirectoryLink(normalize(target)?), 0, modified));
        }
        if metadata.is_dir() {
            return Ok(Entry::new(path, name, EntryKind::Directory, 0, modified));
        }
        if metadata.is_file() {
            return Ok(Entry::new(path, name, EntryKind::File, metadata.len(), modified));
        }
        exn::bail!(ErrorKind::BackendError(format!("unsupported file type at `{}`", path.display())))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list_stream<'a>(&'a self, dir: &'a Path) -> EntryStream<'a> {
        let dir = match self.checked(dir) {
            Ok(dir) => dir,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    yield Err(exn::Exn::from(ErrorKind::from_io(err, &dir)));
                    return;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    // The directory handle itself failed, not a single entry.
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &dir)));
                        break;
                    },
                };
                yield self.entry(entry.path()).await;
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = self.checked(path)?;
        Ok(fs::try_exists(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = self.checked(path)?;
        Ok(fs::read(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?)
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let path = self.checked(path)?;
        let file = fs::File::open(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn stat(&self, path: &Path) -> Result<Entry> {
        let path = self.checked(path)?;
        self.entry(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Read;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("local", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_existing_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
        assert!(LocalBackend::new("name", temp_dir.path().join("missing")).is_err());
        std::fs::write(temp_dir.path().join("file"), b"x").unwrap();
        assert!(LocalBackend::new("name", temp_dir.path().join("file")).is_err());
    }

    #[tokio::test]
    async fn test_list_reports_kinds_and_sizes() {
        let (dir, backend) = backend();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"12345").unwrap();
        let mut entries = backend.list(backend.root()).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.jpg");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].path, backend.root().join("sub"));
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_not_found() {
        let (_dir, backend) = backend();
        let missing = backend.root().join("nope");
        let results: Vec<_> = backend.list_stream(&missing).collect().await;
        assert_eq!(results.len(), 1);
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks() {
        let (dir, backend) = backend();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("file.png"), b"png").unwrap();
        std::os::unix::fs::symlink(dir.path().join("target"), dir.path().join("alias")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("file.png"), dir.path().join("copy.png")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("dangling")).unwrap();

        let alias = backend.stat(&backend.root().join("alias")).await.unwrap();
        let canonical = normalize(std::fs::canonicalize(dir.path().join("target")).unwrap()).unwrap();
        assert_eq!(alias.kind, EntryKind::DirectoryLink(canonical));
        let copy = backend.stat(&backend.root().join("copy.png")).await.unwrap();
        assert_eq!(copy.kind, EntryKind::File);
        assert_eq!(copy.size, 3);

        // The dangling link is an entry-level error, the other entries survive.
        let results: Vec<_> = backend.list_stream(backend.root()).collect().await;
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_reader() {
        let (dir, backend) = backend();
        std::fs::write(dir.path().join("movie.mp4"), b"0123456789").unwrap();
        let mut reader = backend.reader(&backend.root().join("movie.mp4")).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"0123456789");
    }

    #[tokio::test]
    async fn test_exists() {
        let (dir, backend) = backend();
        assert!(!backend.exists(&backend.root().join("a.gif")).await.unwrap());
        std::fs::write(dir.path().join("a.gif"), b"gif").unwrap();
        assert!(backend.exists(&backend.root().join("a.gif")).await.unwrap());
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_dir, backend) = backend();
        assert!(backend.read(Path::new("/etc/passwd")).await.is_err());
        assert!(backend.read(&backend.root().join("../../etc/passwd")).await.is_err());
        assert!(backend.stat(Path::new("relative.jpg")).await.is_err());
    }
}
