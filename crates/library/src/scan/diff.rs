//! Three-way diff of a directory listing against its indexed children.

use gallery_index::filetype::FileKind;
use gallery_index::hash::directory_key;
use gallery_index::{DirectoryRecord, FileRecord, NewDirectory, to_millis};
use gallery_storage::{Entry, EntryKind};
use std::collections::{HashMap, HashSet};
use time::UtcDateTime;

#[derive(Debug, Default)]
pub(crate) struct Diff {
    pub new_directories: Vec<NewDirectory>,
    /// Subdirectories whose modification time moved.
    pub modified_directories: Vec<(i64, UtcDateTime)>,
    pub removed_directories: Vec<i64>,
    pub new_files: Vec<Entry>,
    pub changed_files: Vec<(FileRecord, Entry)>,
    pub removed_files: Vec<i64>,
}
impl Diff {
    pub fn is_empty(&self) -> bool {
        self.new_directories.is_empty()
            && self.modified_directories.is_empty()
            && self.removed_directories.is_empty()
            && self.new_files.is_empty()
            && self.changed_files.is_empty()
            && self.removed_files.is_empty()
    }
}

fn same_time(a: UtcDateTime, b: UtcDateTime) -> bool {
    to_millis(a) == to_millis(b)
}

/// Whether an indexed file no longer describes the entry on disk.
fn file_changed(record: &FileRecord, entry: &Entry) -> bool {
    match &entry.kind {
        EntryKind::DirectoryLink(target) => {
            record.kind != FileKind::Link || directory_key(target).is_ok_and(|key| key != record.content_hash)
        },
        _ => {
            record.kind == FileKind::Link
                || record.size != entry.size
                || !same_time(record.last_modified, entry.modified)
        },
    }
}

/// Compare disk `entries` with the indexed children of one directory.
///
/// Entries are expected to be filtered already. Names in `skipped` failed to
/// list and are left alone on the index side.
pub(crate) fn diff(
    directories: Vec<DirectoryRecord>,
    files: Vec<FileRecord>,
    entries: Vec<Entry>,
    skipped: &HashSet<String>,
) -> Diff {
    let mut result = Diff::default();
    let mut directories: HashMap<String, DirectoryRecord> =
        directories.into_iter().map(|d| (d.name.clone(), d)).collect();
    let mut files: HashMap<String, FileRecord> = files.into_iter().map(|f| (f.name.clone(), f)).collect();

    for entry in entries {
        if entry.is_dir() {
            match directories.remove(&entry.name) {
                None => result.new_directories.push(NewDirectory { name: entry.name, last_modified: entry.modified }),
                Some(record) if !same_time(record.last_modified, entry.modified) => {
                    result.modified_directories.push((record.id, entry.modified))
                },
                Some(_) => {},
            }
            continue;
        }
        match files.remove(&entry.name) {
            None => result.new_files.push(entry),
            Some(record) if file_changed(&record, &entry) => result.changed_files.push((record, entry)),
            Some(_) => {},
        }
    }

    result.removed_directories =
        directories.into_values().filter(|d| !skipped.contains(&d.name)).map(|d| d.id).collect();
    result.removed_files = files.into_values().filter(|f| !skipped.contains(&f.name)).map(|f| f.id).collect();
    result.removed_directories.sort_unstable();
    result.removed_files.sort_unstable();
    result
}
