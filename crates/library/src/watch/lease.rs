//! Single-leader election for the watcher.
//!
//! Several processes may open the same index; only the one holding the
//! lease row watches the filesystem and the others stand by.

use crate::watch::error::{ErrorKind, Result};
use exn::ResultExt;
use gallery_index::{Lease, Leases};
use time::{Duration, UtcDateTime};

pub(crate) const WATCHER_LEASE: &str = "watcher";

/// Identifies this process among lease contenders.
pub(crate) fn holder_id() -> String {
    let started = UtcDateTime::now().unix_timestamp_nanos() / 1_000_000;
    format!("{}-{started}", std::process::id())
}

#[derive(Clone)]
pub(crate) struct LeaseHandle {
    leases: Leases,
    name: String,
    holder: String,
    ttl: Duration,
}
impl LeaseHandle {
    pub fn new(leases: Leases, name: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self { leases, name: name.into(), holder: holder.into(), ttl }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take or renew the lease. `false` while another holder's lease is live.
    pub async fn acquire(&self) -> Result<bool> {
        self.leases.acquire(&self.name, &self.holder, self.ttl).await.or_raise(|| ErrorKind::Lease)
    }

    pub async fn release(&self) -> Result<bool> {
        self.leases.release(&self.name, &self.holder).await.or_raise(|| ErrorKind::Lease)
    }

    pub async fn current(&self) -> Result<Option<Lease>> {
        self.leases.current(&self.name).await.or_raise(|| ErrorKind::Lease)
    }
}
