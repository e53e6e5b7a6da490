//! Configuration loading and validation.
//!
//! Sources are layered with [`figment`], later sources overriding earlier
//! ones:
//!
//! 1. Built-in defaults ([`Config::default`]).
//! 2. `config.toml`, `config.yaml` or `config.json` from the platform config
//!    directory, or a single file given explicitly.
//! 3. `GALLERY_*` environment variables, with `__` separating nested keys
//!    (`GALLERY_LIBRARY__PAGE_SIZE=60`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "GALLERY_";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub library: LibraryConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub watcher: WatcherConfig,
}

/// What gets indexed, and how listings are shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Absolute path to the top of the media tree.
    pub root: PathBuf,
    /// Index entries whose name starts with a dot.
    pub include_dotfiles: bool,
    /// Lowercase extensions (without the dot) that are never indexed.
    pub ignore_extensions: Vec<String>,
    /// Exact file names that are never indexed.
    pub ignore_filenames: Vec<String>,
    /// Items (directories and files combined) per listing page.
    pub page_size: usize,
    /// File stems that win the directory cover election, in priority order.
    pub cover_names: Vec<String>,
    /// Files hashed concurrently while reconciling one directory.
    pub scan_concurrency: usize,
}
impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            include_dotfiles: false,
            ignore_extensions: vec!["ini".into(), "db".into(), "tmp".into(), "part".into()],
            ignore_filenames: vec!["Thumbs.db".into(), ".DS_Store".into(), "desktop.ini".into()],
            page_size: 30,
            cover_names: vec!["cover".into(), "folder".into(), "thumbnail".into()],
            scan_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,
    pub max_connections: Option<u32>,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = project_dirs()
            .map(|dirs| dirs.data_dir().join("index.db"))
            .unwrap_or_else(|| PathBuf::from("gallery.db"));
        Self { path, max_connections: None }
    }
}

/// Capacities of the process-local LRU caches (entry counts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub records: u64,
    pub layouts: u64,
    pub distinct: u64,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self { records: 10_000, layouts: 2_000, distinct: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// Events for the same directories within this window are invalidated together.
    pub coalesce_ms: u64,
    /// Watcher leadership expires unless renewed within this many seconds.
    pub lease_ttl_secs: u64,
}
impl Default for WatcherConfig {
    fn default() -> Self {
        Self { enabled: true, coalesce_ms: 250, lease_ttl_secs: 30 }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "gallery")
}

impl Config {
    /// Load configuration from defaults, a config file, and the environment.
    ///
    /// When `file` is `Some`, only that file is read and it must exist.
    /// Otherwise every `config.{toml,yaml,json}` present in the platform
    /// config directory is merged, in that order.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match file {
            Some(path) => {
                if !path.exists() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                figment = merge_file(figment, path)?;
            },
            None => {
                if let Some(dirs) = project_dirs() {
                    for name in ["config.toml", "config.yaml", "config.json"] {
                        let path = dirs.config_dir().join(name);
                        if path.exists() {
                            tracing::debug!(path = %path.display(), "Merging configuration file");
                            figment = merge_file(figment, &path)?;
                        }
                    }
                }
            },
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR)))
    }

    /// Extract and validate a configuration from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.library.root.is_absolute() {
            exn::bail!(ErrorKind::Invalid("library.root"));
        }
        if self.library.page_size == 0 {
            exn::bail!(ErrorKind::Invalid("library.page_size"));
        }
        if self.library.scan_concurrency == 0 {
            exn::bail!(ErrorKind::Invalid("library.scan_concurrency"));
        }
        if self.cache.records == 0 || self.cache.layouts == 0 || self.cache.distinct == 0 {
            exn::bail!(ErrorKind::Invalid("cache"));
        }
        if self.watcher.lease_ttl_secs == 0 {
            exn::bail!(ErrorKind::Invalid("watcher.lease_ttl_secs"));
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}
