//! Filesystem watcher driving lazy invalidation.
//!
//! Events never trigger a scan. They are coalesced for a short window, mapped
//! to their nearest indexed directory and invalidated with fan-out; the next
//! read rescans whatever went stale.

mod coalesce;
pub(crate) mod error;
mod lease;

use crate::error::{ErrorKind as LibraryErrorKind, Result as LibraryResult};
use crate::scan::EntryFilter;
use crate::tracking::Invalidator;
use crate::watch::coalesce::Coalescer;
use crate::watch::error::{ErrorKind, Result};
use crate::watch::lease::{LeaseHandle, WATCHER_LEASE, holder_id};
use exn::ResultExt;
use gallery_config::WatcherConfig;
use gallery_index::Database;
use gallery_storage::normalize_path;
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Events buffered between the notifier thread and the watcher task.
const EVENT_BUFFER: usize = 1024;

/// Why a stint as leader ended.
#[derive(Debug, PartialEq, Eq)]
enum Leadership {
    Stopped,
    Lost,
}

pub struct Watcher {
    invalidator: Invalidator,
    lease: LeaseHandle,
    filter: EntryFilter,
    root: PathBuf,
    coalesce: Duration,
    heartbeat: Duration,
}
impl Watcher {
    pub(crate) fn new(
        db: &Database,
        invalidator: Invalidator,
        filter: EntryFilter,
        root: PathBuf,
        config: &WatcherConfig,
    ) -> Self {
        let ttl = Duration::from_secs(config.lease_ttl_secs.max(1));
        Self {
            invalidator,
            lease: LeaseHandle::new(
                db.leases(),
                WATCHER_LEASE,
                holder_id(),
                time::Duration::seconds(ttl.as_secs() as i64),
            ),
            filter,
            root,
            coalesce: Duration::from_millis(config.coalesce_ms.max(1)),
            heartbeat: (ttl / 3).max(Duration::from_millis(100)),
        }
    }

    /// Lease holder name of this process.
    pub fn holder(&self) -> &str {
        self.lease.holder()
    }

    /// Watch the library root until `shutdown` is cancelled.
    ///
    /// Stands by while another process holds the watcher lease, and takes
    /// over once that lease expires.
    pub async fn run(&self, shutdown: CancellationToken) -> LibraryResult<()> {
        self.run_inner(shutdown).await.or_raise(|| LibraryErrorKind::Watch)
    }

    async fn run_inner(&self, shutdown: CancellationToken) -> Result<()> {
        while !shutdown.is_cancelled() {
            match self.lease.acquire().await {
                Ok(true) => {
                    tracing::info!(root = %self.root.display(), holder = self.holder(), "Watching library");
                    match self.lead(&shutdown).await {
                        Ok(Leadership::Lost) => tracing::warn!("Lost watcher lease; standing by"),
                        Ok(Leadership::Stopped) => {
                            self.lease.release().await?;
                            return Ok(());
                        },
                        Err(e) => {
                            if let Err(release) = self.lease.release().await {
                                tracing::warn!(error = ?release, "Could not release watcher lease");
                            }
                            return Err(e);
                        },
                    }
                },
                Ok(false) => {
                    let holder = self.lease.current().await.ok().flatten().map(|lease| lease.holder);
                    tracing::debug!(?holder, "Watcher lease held elsewhere; standing by");
                },
                Err(e) => tracing::warn!(error = ?e, "Could not check watcher lease"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.heartbeat) => {},
            }
        }
        Ok(())
    }

    async fn lead(&self, shutdown: &CancellationToken) -> Result<Leadership> {
        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(EVENT_BUFFER);
        let mut watcher = notify::recommended_watcher(move |event| {
            // The receiver is gone once leadership ends.
            let _ = tx.blocking_send(event);
        })
        .or_raise(|| ErrorKind::Notify)?;
        watcher.watch(&self.root, RecursiveMode::Recursive).or_raise(|| ErrorKind::Notify)?;

        let mut coalescer = Coalescer::default();
        let mut flush = tokio::time::interval(self.coalesce);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate and the lease was just acquired.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush(&mut coalescer).await;
                    return Ok(Leadership::Stopped);
                },
                event = rx.recv() => match event {
                    Some(Ok(event)) => self.event_paths(&event).into_iter().for_each(|p| coalescer.push(p)),
                    Some(Err(e)) => tracing::warn!(error = %e, "Filesystem notification error"),
                    None => exn::bail!(ErrorKind::Notify),
                },
                _ = flush.tick() => self.flush(&mut coalescer).await,
                _ = heartbeat.tick() => match self.lease.acquire().await {
                    Ok(true) => {},
                    Ok(false) => return Ok(Leadership::Lost),
                    Err(e) => {
                        tracing::warn!(error = ?e, "Could not renew watcher lease");
                        return Ok(Leadership::Lost);
                    },
                },
            }
        }
    }

    /// Invalidate everything pending. Paths stay queued if that fails.
    async fn flush(&self, coalescer: &mut Coalescer) {
        if coalescer.is_empty() {
            return;
        }
        let paths = coalescer.drain();
        match self.invalidator.invalidate_paths(&paths).await.or_raise(|| ErrorKind::Invalidate) {
            Ok(affected) => tracing::debug!(paths = paths.len(), affected = affected.len(), "Invalidated from events"),
            Err(e) => {
                tracing::warn!(error = ?e, "Invalidation failed; retrying on next flush");
                paths.into_iter().for_each(|p| coalescer.push(p));
            },
        }
    }

    /// Paths of an event worth invalidating.
    pub(crate) fn event_paths(&self, event: &Event) -> Vec<PathBuf> {
        if matches!(event.kind, EventKind::Access(_)) {
            return Vec::new();
        }
        if event.need_rescan() {
            return vec![self.root.clone()];
        }
        event
            .paths
            .iter()
            .filter_map(|p| normalize_path(p).ok())
            .filter(|p| p.starts_with(&self.root) && !self.is_ignored(p))
            .collect()
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        let names: Vec<&str> = relative.iter().filter_map(|c| c.to_str()).collect();
        match names.split_last() {
            Some((name, parents)) => {
                self.filter.ignores_file(name) || parents.iter().any(|parent| self.filter.ignores_name(parent))
            },
            None => false,
        }
    }
}
