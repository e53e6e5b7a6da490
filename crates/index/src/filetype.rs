//! Extension classification.
//!
//! The `filetypes` table is read once into a [`FileTypes`] lookup; the scanner
//! resolves every entry to a [`FileKind`] at classification time and stores it
//! on the record, so nothing downstream has to re-inspect extensions.

use crate::Database;
use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use gallery_storage::extension_of;
use std::collections::HashMap;
use std::str::FromStr;

/// Extension of the fallback row used for unknown extensions.
pub const FALLBACK_EXTENSION: &str = "";
/// Pseudo-extension of the row describing directories.
pub const DIRECTORY_EXTENSION: &str = ".dir";
/// Pseudo-extension of the row describing directory links.
pub const LINK_EXTENSION: &str = ".link";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FileKind {
    #[display("dir")]
    Directory,
    #[display("image")]
    Image,
    #[display("movie")]
    Movie,
    #[display("pdf")]
    Pdf,
    #[display("archive")]
    Archive,
    #[display("link")]
    Link,
    #[display("other")]
    Other,
}
impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "dir",
            Self::Image => "image",
            Self::Movie => "movie",
            Self::Pdf => "pdf",
            Self::Archive => "archive",
            Self::Link => "link",
            Self::Other => "other",
        }
    }

    /// Kinds an external renderer can produce a thumbnail for.
    pub fn is_renderable(&self) -> bool {
        matches!(self, Self::Image | Self::Movie | Self::Pdf | Self::Archive)
    }
}
impl FromStr for FileKind {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "dir" => Self::Directory,
            "image" => Self::Image,
            "movie" => Self::Movie,
            "pdf" => Self::Pdf,
            "archive" => Self::Archive,
            "link" => Self::Link,
            "other" => Self::Other,
            _ => exn::bail!(ErrorKind::InvalidData("file kind")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub(crate) struct FileTypeRow {
    extension: String,
    kind: String,
    generic: bool,
    color: String,
    icon: String,
}

/// Capability flags of one extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileType {
    pub extension: String,
    pub kind: FileKind,
    /// Always shown with its icon; never rendered.
    pub generic: bool,
    pub color: String,
    pub icon: String,
}
impl FileType {
    pub fn is_thumbnailable(&self) -> bool {
        !self.generic && self.kind.is_renderable()
    }
}
impl TryFrom<FileTypeRow> for FileType {
    type Error = crate::Error;
    fn try_from(row: FileTypeRow) -> Result<Self> {
        Ok(Self {
            kind: row.kind.parse()?,
            extension: row.extension,
            generic: row.generic,
            color: row.color,
            icon: row.icon,
        })
    }
}

/// Read-mostly classifier: extension to [`FileType`].
#[derive(Debug, Clone)]
pub struct FileTypes {
    by_extension: HashMap<String, FileType>,
    fallback: FileType,
    directory: FileType,
    link: FileType,
}
impl FileTypes {
    /// Load the classification table from the index.
    pub async fn load(db: &Database) -> Result<Self> {
        let rows: Vec<FileTypeRow> = sqlx::query_as("SELECT extension, kind, generic, color, icon FROM filetypes")
            .fetch_all(db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        let types = rows.into_iter().map(FileType::try_from).collect::<Result<Vec<_>>>()?;
        Self::from_types(types)
    }

    /// Build a classifier from explicit rows.
    ///
    /// The fallback, directory and link rows must be present.
    pub fn from_types(types: impl IntoIterator<Item = FileType>) -> Result<Self> {
        let mut by_extension: HashMap<String, FileType> =
            types.into_iter().map(|t| (t.extension.to_ascii_lowercase(), t)).collect();
        let fallback =
            by_extension.get(FALLBACK_EXTENSION).cloned().ok_or_raise(|| ErrorKind::InvalidData("fallback filetype"))?;
        let directory =
            by_extension.remove(DIRECTORY_EXTENSION).ok_or_raise(|| ErrorKind::InvalidData("directory filetype"))?;
        let link = by_extension.remove(LINK_EXTENSION).ok_or_raise(|| ErrorKind::InvalidData("link filetype"))?;
        Ok(Self { by_extension, fallback, directory, link })
    }

    /// Classify a file by name. Unknown extensions get the fallback type.
    pub fn classify(&self, name: &str) -> &FileType {
        self.by_extension.get(&extension_of(name)).unwrap_or(&self.fallback)
    }

    pub fn directory(&self) -> &FileType {
        &self.directory
    }

    pub fn link(&self) -> &FileType {
        &self.link
    }

    /// Look up a type by the extension stored on a record.
    pub fn get(&self, extension: &str) -> &FileType {
        match extension {
            DIRECTORY_EXTENSION => &self.directory,
            LINK_EXTENSION => &self.link,
            other => self.by_extension.get(other).unwrap_or(&self.fallback),
        }
    }
}
