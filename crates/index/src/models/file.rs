use crate::error::Error;
use crate::filetype::FileKind;
use crate::hash::FileHashes;
use crate::models::{from_millis, size_from_db};
use std::path::{Path, PathBuf};
use time::UtcDateTime;

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FileRow {
    pub(crate) id: i64,
    pub(crate) directory_id: i64,
    pub(crate) virtual_directory_id: Option<i64>,
    pub(crate) directory_path: String,
    pub(crate) name: String,
    pub(crate) content_hash: String,
    pub(crate) unique_hash: String,
    pub(crate) size: i64,
    pub(crate) last_modified: i64,
    pub(crate) filetype: String,
    pub(crate) kind: String,
    pub(crate) is_animated: bool,
    pub(crate) delete_pending: bool,
    pub(crate) generic_icon: bool,
}

/// An indexed file (or directory link).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub directory_id: i64,
    /// Target of a [`FileKind::Link`] entry.
    pub virtual_directory_id: Option<i64>,
    /// Absolute path, derived from the parent directory.
    pub path: PathBuf,
    pub name: String,
    pub content_hash: String,
    pub unique_hash: String,
    pub size: u64,
    pub last_modified: UtcDateTime,
    /// Extension key into the filetype table.
    pub filetype: String,
    pub kind: FileKind,
    pub is_animated: bool,
    pub delete_pending: bool,
    /// Rendering failed (or is impossible); serve the filetype icon.
    pub generic_icon: bool,
}
impl FileRecord {
    /// File name without its final extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.name).file_stem().and_then(|s| s.to_str()).unwrap_or(&self.name)
    }
}

impl TryFrom<FileRow> for FileRecord {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            directory_id: row.directory_id,
            virtual_directory_id: row.virtual_directory_id,
            path: PathBuf::from(row.directory_path).join(&row.name),
            name: row.name,
            content_hash: row.content_hash,
            unique_hash: row.unique_hash,
            size: size_from_db(row.size)?,
            last_modified: from_millis(row.last_modified)?,
            filetype: row.filetype,
            kind: row.kind.parse()?,
            is_animated: row.is_animated,
            delete_pending: row.delete_pending,
            generic_icon: row.generic_icon,
        })
    }
}

/// Everything the scanner knows about a file that is about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub directory_id: i64,
    pub virtual_directory_id: Option<i64>,
    pub name: String,
    pub hashes: FileHashes,
    pub size: u64,
    pub last_modified: UtcDateTime,
    pub filetype: String,
    pub kind: FileKind,
    pub is_animated: bool,
}

/// A new state for an existing file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpdate {
    pub id: i64,
    pub file: NewFile,
    /// The bytes changed, so a previous render failure no longer applies.
    pub content_changed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> FileRow {
        FileRow {
            id: 7,
            directory_id: 3,
            virtual_directory_id: None,
            directory_path: "/albums/x".to_string(),
            name: "holiday.final.jpg".to_string(),
            content_hash: "c".repeat(64),
            unique_hash: "u".repeat(64),
            size: 1024,
            last_modified: 1_700_000_000_123,
            filetype: "jpg".to_string(),
            kind: "image".to_string(),
            is_animated: false,
            delete_pending: false,
            generic_icon: false,
        }
    }

    #[test]
    fn test_row_to_model() {
        let record = FileRecord::try_from(row()).unwrap();
        assert_eq!(record.path, PathBuf::from("/albums/x/holiday.final.jpg"));
        assert_eq!(record.stem(), "holiday.final");
        assert_eq!(record.kind, FileKind::Image);
        assert_eq!(record.last_modified.millisecond(), 123);
    }

    #[test]
    fn test_row_to_model_rejects_bad_data() {
        let mut bad = row();
        bad.size = -1;
        assert!(FileRecord::try_from(bad).is_err());
        let mut bad = row();
        bad.kind = "spreadsheet".to_string();
        assert!(FileRecord::try_from(bad).is_err());
    }

    #[test]
    fn test_root_directory_paths() {
        let mut at_root = row();
        at_root.directory_path = "/".to_string();
        let record = FileRecord::try_from(at_root).unwrap();
        assert_eq!(record.path, PathBuf::from("/holiday.final.jpg"));
    }
}
