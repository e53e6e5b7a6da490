//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the scanner's only view of
//! the filesystem. Listing is one directory at a time: the index is
//! reconciled per directory, never by walking a whole subtree.

mod local;
#[cfg(feature = "mock")]
mod mock;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
use crate::Entry;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::io::Read;
use std::path::Path;
use std::pin::Pin;

pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<Entry>> + Send + 'a>>;
pub type BoxSyncRead = Box<dyn Read + Send + 'static>;

/// Unified interface for storage backends.
///
/// # Path Handling
/// All paths are absolute and must lie within [`root()`](Self::root).
/// Implementations normalize them with
/// [`normalize_path`](crate::normalize_path) and reject anything that
/// escapes the root.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use gallery_storage::{backend::StorageBackend, error::Result};
///
/// async fn size_of_cover(backend: &dyn StorageBackend) -> Result<u64> {
///     let path = Path::new("/albums/holiday/cover.jpg");
///     if backend.exists(path).await? {
///         Ok(backend.stat(path).await?.size)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// The library root; nothing above it is ever listed or read.
    fn root(&self) -> &Path;

    /// List the immediate children of a directory.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`], failing on the first entry error.
    async fn list(&self, dir: &Path) -> Result<Vec<Entry>> {
        self.list_stream(dir).try_collect().await
    }

    /// Stream the immediate children of a directory.
    ///
    /// Entry-level failures (an entry vanished between `readdir` and `stat`,
    /// permission denied on one file, a non UTF-8 name) are yielded as `Err`
    /// items and the stream carries on with the next entry. Failing to open
    /// the directory itself yields a single `Err` and ends the stream.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::StreamExt;
    /// use std::path::Path;
    /// # use gallery_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(Path::new("/albums"));
    /// while let Some(entry) = stream.next().await {
    ///     match entry {
    ///         Ok(entry) => println!("{}: {} bytes", entry.name, entry.size),
    ///         Err(e) => eprintln!("skipping: {e}"),
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, dir: &'a Path) -> EntryStream<'a>;

    /// Check if a file or directory exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Open a file for streaming reads.
    ///
    /// Returns a `'static` boxed [`Read`](std::io::Read) suitable for use
    /// inside [`spawn_blocking`](tokio::task::spawn_blocking), which is how
    /// large media files get hashed without buffering them whole.
    async fn reader(&self, path: &Path) -> Result<BoxSyncRead>;

    /// Get metadata for a single path without reading contents.
    async fn stat(&self, path: &Path) -> Result<Entry>;
}
