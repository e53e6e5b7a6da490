//! Identity hashes.
//!
//! Every hash in the index is a lowercase hex SHA-256 digest:
//!
//! - A directory's identity is the hash of its normalized path with a
//!   trailing `/`, so it can be computed from a path alone without touching
//!   the database.
//! - A file's content hash covers only its bytes and is shared by duplicates.
//! - A file's unique hash covers its bytes followed by its full path.

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use gallery_storage::normalize_path;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

const READ_BUFFER: usize = 64 * 1024;

/// The UTF-8 form of a normalized path, as stored in the index.
pub fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))
}

/// Identity hash of a directory path.
///
/// The path is normalized first, so `/albums/x`, `/albums/x/` and
/// `/albums/./x` all share one identity.
///
/// ```
/// use gallery_index::hash::directory_key;
///
/// let a = directory_key("/albums/x").unwrap();
/// assert_eq!(a, directory_key("/albums/./x/").unwrap());
/// assert_ne!(a, directory_key("/albums/y").unwrap());
/// ```
pub fn directory_key(path: impl AsRef<Path>) -> Result<String> {
    let path = normalized(path.as_ref())?;
    directory_key_normalized(&path)
}

/// Like [`directory_key`], for a path that is already normalized.
pub(crate) fn directory_key_normalized(path: &Path) -> Result<String> {
    let mut key = path_str(path)?.to_string();
    if !key.ends_with('/') {
        key.push('/');
    }
    Ok(digest(key.as_bytes()))
}

fn normalized(path: &Path) -> Result<PathBuf> {
    normalize_path(path).or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))
}

/// Hash an arbitrary byte slice.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Key for the thumbnail of an archive member.
///
/// Members are never indexed themselves, so their thumbnails are addressed by
/// the archive's content hash combined with the member's path inside it.
pub fn archive_member_key(archive_hash: &str, member: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(archive_hash.as_bytes());
    hasher.update(member.as_bytes());
    hex::encode(hasher.finalize())
}

/// Both hashes of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashes {
    pub content: String,
    pub unique: String,
}

/// Computes [`FileHashes`] in a single pass over the file's bytes.
#[derive(Default)]
pub struct FileHasher {
    content: Sha256,
    unique: Sha256,
}
impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.content.update(bytes);
        self.unique.update(bytes);
    }

    /// Finish hashing, mixing `path` into the unique hash.
    pub fn finish(mut self, path: &Path) -> Result<FileHashes> {
        self.unique.update(path_str(path)?.as_bytes());
        Ok(FileHashes {
            content: hex::encode(self.content.finalize()),
            unique: hex::encode(self.unique.finalize()),
        })
    }

    /// Feed everything a blocking reader yields into the hasher.
    ///
    /// Intended for `spawn_blocking`; large media files are streamed instead
    /// of loaded into memory.
    pub fn read_all(&mut self, mut reader: impl Read) -> std::io::Result<()> {
        let mut buffer = vec![0; READ_BUFFER];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(n) => self.update(&buffer[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Hashes of a symlink to a directory.
///
/// A link has no bytes of its own; its content is the normalized target path,
/// which makes its content hash equal to the target directory's identity.
pub fn link_hashes(target: &Path, path: &Path) -> Result<FileHashes> {
    let target = normalized(target)?;
    let content = directory_key_normalized(&target)?;
    let mut unique = Sha256::new();
    unique.update(path_str(&target)?.as_bytes());
    unique.update(path_str(path)?.as_bytes());
    Ok(FileHashes { content, unique: hex::encode(unique.finalize()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/albums/x", "/albums/x/")]
    #[case("/albums/x", "/albums/x/./")]
    #[case("/albums/x", "/albums/y/../x")]
    fn test_directory_key_normalizes(#[case] a: &str, #[case] b: &str) {
        assert_eq!(directory_key(a).unwrap(), directory_key(b).unwrap());
    }

    #[test]
    fn test_directory_key_is_sha256_with_trailing_slash() {
        assert_eq!(directory_key("/").unwrap(), digest(b"/"));
        assert_eq!(directory_key("/albums").unwrap(), digest(b"/albums/"));
        assert!(directory_key("relative").is_err());
    }

    #[test]
    fn test_content_hash_survives_rename() {
        let mut a = FileHasher::new();
        a.update(b"same bytes");
        let a = a.finish(Path::new("/albums/a.jpg")).unwrap();
        let mut b = FileHasher::new();
        b.read_all(&b"same bytes"[..]).unwrap();
        let b = b.finish(Path::new("/albums/renamed.jpg")).unwrap();
        assert_eq!(a.content, b.content);
        assert_ne!(a.unique, b.unique);
        assert_eq!(a.content, digest(b"same bytes"));
    }

    #[test]
    fn test_link_hashes() {
        let hashes = link_hashes(Path::new("/albums/target"), Path::new("/albums/alias")).unwrap();
        assert_eq!(hashes.content, directory_key("/albums/target").unwrap());
        let other = link_hashes(Path::new("/albums/target"), Path::new("/albums/other")).unwrap();
        assert_ne!(hashes.unique, other.unique);
    }

    #[test]
    fn test_archive_member_key() {
        let a = archive_member_key("abc", "001.jpg");
        assert_ne!(a, archive_member_key("abc", "002.jpg"));
        assert_ne!(a, archive_member_key("abd", "001.jpg"));
    }
}
