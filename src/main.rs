//! Maintenance tooling for a gallery index.

mod error;

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use exn::ResultExt;
use gallery_config::Config;
use gallery_index::filetype::FileKind;
use gallery_index::{SortOrder, Tier};
use gallery_library::thumbnail::error::{ErrorKind as RenderErrorKind, Result as RenderResult};
use gallery_library::{Library, Renderer};
use gallery_storage::backend::LocalBackend;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gallery", version, about = "Index a media tree and keep its thumbnail cache in sync")]
struct Cli {
    /// Configuration file to use instead of the platform config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile one directory against the index.
    Scan {
        /// Defaults to the library root.
        path: Option<PathBuf>,
        /// Rescan even if the directory is up to date.
        #[arg(short, long)]
        force: bool,
    },
    /// Index directories right away.
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Mark paths (and every ancestor) stale.
    Invalidate {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print one page of a directory.
    List {
        path: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = Sort::Name)]
        sort: Sort,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
    },
    /// Watch the library and invalidate on change, until interrupted.
    Watch,
    /// Delete tombstoned records and orphaned thumbnails.
    Purge,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Sort {
    Name,
    Modified,
    Newest,
}
impl From<Sort> for SortOrder {
    fn from(sort: Sort) -> Self {
        match sort {
            Sort::Name => SortOrder::Name,
            Sort::Modified => SortOrder::Modified,
            Sort::Newest => SortOrder::Newest,
        }
    }
}

/// The CLI never serves thumbnails.
struct NoRenderer;
#[async_trait]
impl Renderer for NoRenderer {
    async fn render(&self, kind: FileKind, _source: &[u8], tier: Tier) -> RenderResult<Vec<u8>> {
        exn::bail!(RenderErrorKind::Render(format!("no renderer for {kind} at {tier}")))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let backend = LocalBackend::new("library", &config.library.root).or_raise(|| ErrorKind::Storage)?;
    let library = Library::open(&config, Arc::new(backend), Arc::new(NoRenderer), None)
        .await
        .or_raise(|| ErrorKind::Open)?;
    let root = library.root().to_path_buf();

    match cli.command {
        Command::Scan { path, force } => {
            let report = library.reconcile(path.unwrap_or(root), force).await.or_raise(|| ErrorKind::Command)?;
            println!(
                "created {} updated {} tombstoned {} skipped {}{}",
                report.created,
                report.updated,
                report.tombstoned,
                report.skipped,
                if report.fresh { " (up to date)" } else { "" }
            );
        },
        Command::Add { paths } => {
            for path in paths {
                let directory = library.add_directory(&path).await.or_raise(|| ErrorKind::Command)?;
                println!("{}\t{}", directory.path_hash, directory.path.display());
            }
        },
        Command::Invalidate { paths } => {
            let affected = library.invalidate_many(&paths).await.or_raise(|| ErrorKind::Command)?;
            println!("invalidated {} directories", affected.len());
        },
        Command::List { path, sort, page } => {
            let layout =
                library.listing(path.unwrap_or(root), sort.into(), page).await.or_raise(|| ErrorKind::Command)?;
            for directory in &layout.directories {
                println!("{}/", directory.name);
            }
            for file in &layout.files {
                println!("{}\t{}\t{}", file.name, file.size, file.kind);
            }
            println!("page {} of {} ({} directories, {} files)", page, layout.total_pages, layout.dir_count, layout.file_count);
        },
        Command::Watch => {
            if !config.watcher.enabled {
                tracing::warn!("Watcher disabled in configuration");
                return Ok(());
            }
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutting down");
                }
                signal.cancel();
            });
            library.watcher().run(shutdown).await.or_raise(|| ErrorKind::Command)?;
        },
        Command::Purge => {
            let report = library.purge_tombstones().await.or_raise(|| ErrorKind::Command)?;
            let thumbnails = library.purge_orphaned_thumbnails().await.or_raise(|| ErrorKind::Command)?;
            println!("purged {} directories, {} files, {} thumbnails", report.directories, report.files, thumbnails);
        },
    }
    Ok(())
}
