//! Path validation and normalization.
//!
//! Every path that enters the index goes through [`normalize`] first, so the
//! same directory always produces the same string (and therefore the same
//! identity hash) regardless of how the caller spelled it.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Lexically normalizes an absolute path.
///
/// > **Note:** This does **not** touch the filesystem: symlinks are not
/// >           resolved and the path does not need to exist. Null bytes are
/// >           explicitly rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use gallery_storage::normalize_path;
/// assert_eq!(normalize_path("/albums/./x//y/").unwrap(), Path::new("/albums/x/y"));
/// assert_eq!(normalize_path("/albums/x/../y").unwrap(), Path::new("/albums/y"));
/// assert_eq!(normalize_path("/").unwrap(), Path::new("/"));
/// // Relative paths and escaping the filesystem root are rejected.
/// assert!(normalize_path("albums/x").is_err());
/// assert!(normalize_path("/../etc").is_err());
/// assert!(normalize_path("/a\0b").is_err());
/// ```
pub fn normalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if !path.is_absolute() {
        exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
    }
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls; reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
            },
        }
    }
    let mut normalized = PathBuf::from("/");
    normalized.extend(components);
    Ok(normalized)
}

/// Normalizes `path` and checks that it lives at or below `root`.
///
/// `root` is expected to already be normalized.
pub fn within(root: &Path, path: impl AsRef<Path>) -> Result<PathBuf> {
    let normalized = normalize(path.as_ref())?;
    // Path::starts_with is component-based: "/albums-old" is not within "/albums".
    if !normalized.starts_with(root) {
        exn::bail!(ErrorKind::InvalidPath(normalized));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize("/a//b//c").unwrap(), Path::new("/a/b/c"));
        assert_eq!(normalize("/a/./b/./c").unwrap(), Path::new("/a/b/c"));
        assert_eq!(normalize("/a/b/c/").unwrap(), Path::new("/a/b/c"));
        assert_eq!(normalize("/a/b/..").unwrap(), Path::new("/a"));
    }

    #[test]
    fn test_traversal_attempts() {
        assert!(normalize("/..").is_err());
        assert!(normalize("/a/../../b").is_err());
    }

    #[test]
    fn test_relative_rejected() {
        assert!(normalize("").is_err());
        assert!(normalize("a/b").is_err());
        assert!(normalize("./a").is_err());
    }

    #[test]
    fn test_invalid_characters() {
        assert!(normalize("/a\0b").is_err());
    }

    #[test]
    fn test_within_root() {
        let root = Path::new("/albums");
        assert_eq!(within(root, "/albums/x/../y").unwrap(), Path::new("/albums/y"));
        assert_eq!(within(root, "/albums").unwrap(), Path::new("/albums"));
        assert!(within(root, "/albums-old/x").is_err());
        assert!(within(root, "/albums/../etc").is_err());
    }
}
