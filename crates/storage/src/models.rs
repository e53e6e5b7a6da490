//! Storage models.
//!
//! These types describe what a storage backend reports about a single entry
//! of a directory listing; the scanner diffs them against the index.

use std::path::{Path, PathBuf};
use time::UtcDateTime;

/// What kind of filesystem object an [`Entry`] is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file (or a symlink to one, reported with the target's metadata).
    File,
    /// A directory.
    Directory,
    /// A symlink whose (normalized) target is a directory.
    DirectoryLink(PathBuf),
}

/// File metadata returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Absolute, normalized path.
    pub path: PathBuf,
    /// Final path component, guaranteed UTF-8.
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (zero for directories).
    pub size: u64,
    /// Last modified timestamp
    pub modified: UtcDateTime,
}
impl Entry {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, kind: EntryKind, size: u64, modified: UtcDateTime) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            kind,
            size,
            modified,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// Lowercased extension without the dot, or an empty string.
    pub fn extension(&self) -> String {
        extension_of(&self.name)
    }
}

/// Lowercased extension of a file name, without the leading dot.
///
/// Dot-files without a further dot (`.hidden`) have no extension.
pub fn extension_of(name: &str) -> String {
    Path::new(name).extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).unwrap_or_default()
}
