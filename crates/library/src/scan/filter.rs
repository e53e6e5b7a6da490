use gallery_config::LibraryConfig;
use gallery_storage::{Entry, extension_of};
use std::collections::HashSet;

/// Ignore-lists and the dot-file policy.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    include_dotfiles: bool,
    /// Lowercased, without the leading dot.
    extensions: HashSet<String>,
    /// Lowercased.
    filenames: HashSet<String>,
}
impl EntryFilter {
    pub fn new(config: &LibraryConfig) -> Self {
        Self {
            include_dotfiles: config.include_dotfiles,
            extensions: config
                .ignore_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            filenames: config.ignore_filenames.iter().map(|f| f.to_ascii_lowercase()).collect(),
        }
    }

    /// Whether a name is excluded regardless of what kind of entry it is.
    pub fn ignores_name(&self, name: &str) -> bool {
        (!self.include_dotfiles && name.starts_with('.')) || self.filenames.contains(&name.to_ascii_lowercase())
    }

    /// Extension ignore-lists apply to files only.
    pub fn ignores_file(&self, name: &str) -> bool {
        if self.ignores_name(name) {
            return true;
        }
        let extension = extension_of(name);
        !extension.is_empty() && self.extensions.contains(&extension)
    }

    pub fn allows(&self, entry: &Entry) -> bool {
        match entry.is_dir() {
            true => !self.ignores_name(&entry.name),
            false => !self.ignores_file(&entry.name),
        }
    }
}
