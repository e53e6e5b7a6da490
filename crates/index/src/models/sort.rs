use crate::error::{Error, ErrorKind};
use derive_more::Display;
use std::str::FromStr;

/// Order of a directory listing.
///
/// Directories and files are sorted separately by the same order; ties
/// always break on name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SortOrder {
    #[default]
    #[display("name")]
    Name,
    /// Oldest first.
    #[display("modified")]
    Modified,
    /// Newest first.
    #[display("newest")]
    Newest,
}
impl SortOrder {
    pub(crate) fn directory_order(&self) -> &'static str {
        match self {
            Self::Name => "d.name COLLATE NOCASE, d.name",
            Self::Modified => "d.last_modified ASC, d.name COLLATE NOCASE, d.name",
            Self::Newest => "d.last_modified DESC, d.name COLLATE NOCASE, d.name",
        }
    }

    pub(crate) fn file_order(&self) -> &'static str {
        match self {
            Self::Name => "f.name COLLATE NOCASE, f.name",
            Self::Modified => "f.last_modified ASC, f.name COLLATE NOCASE, f.name",
            Self::Newest => "f.last_modified DESC, f.name COLLATE NOCASE, f.name",
        }
    }
}
impl FromStr for SortOrder {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "name" | "alpha" => Self::Name,
            "modified" | "date" => Self::Modified,
            "newest" | "reverse-date" => Self::Newest,
            _ => exn::bail!(ErrorKind::InvalidData("sort order")),
        })
    }
}
