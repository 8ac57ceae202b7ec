//! # Cluster Lock
//!
//! Single-owner mutual exclusion for the SPM role across every host that
//! shares a storage domain. The shared storage itself is the arbitration
//! channel; there is no quorum service.
//!
//! Two implementations are available and chosen at deployment time:
//!
//! - [`DaemonLease`]: host-id registration in a lockspace, then a named
//!   resource lease at a fixed offset. Preferred.
//! - [`LegacyLease`]: an external helper process that maintains a lease
//!   block on the leases volume.
//!
//! Both are used through generics over [`ClusterLock`].

mod file_backend;
mod lease_daemon;
mod legacy;

use std::path::PathBuf;

pub use file_backend::FileLeaseDaemon;
pub use lease_daemon::{
    DaemonLease, DaemonResult, LeaseDaemon, LeaseDaemonError, LeaseDisk, LeaseHandle,
    LeaseRegistration,
};
pub use legacy::LegacyLease;

use crate::{
    ids::{DomainId, HostId},
    Result,
};

/// Reserved host id of the lease-daemon variant.
pub const DAEMON_RESERVED_ID: u16 = 250;

/// Reserved host id of the legacy variant.
pub const LEGACY_RESERVED_ID: u16 = 1000;

/// The seven operations every cluster lock provides.
#[async_trait::async_trait]
pub trait ClusterLock: Send + Sync {
    fn domain(&self) -> DomainId;

    /// Format the on-storage lock areas of a new domain.
    async fn init_lock(&self) -> Result<()>;

    /// Register this host in the domain lockspace.
    ///
    /// Idempotent: an existing registration is success.
    async fn acquire_host_id(&self, host_id: HostId, is_async: bool) -> Result<()>;

    /// Leave the domain lockspace.
    ///
    /// Idempotent: a missing registration is success.
    async fn release_host_id(&self, host_id: HostId, is_async: bool, unused: bool)
        -> Result<()>;

    /// Live check of the lockspace registration. Never errors; any failure
    /// reads as `false`.
    async fn has_host_id(&self, host_id: HostId) -> bool;

    /// Take the SPM lease.
    async fn acquire(&self, host_id: HostId) -> Result<()>;

    /// Drop the SPM lease. Local ownership is cleared even when the
    /// underlying release fails.
    async fn release(&self) -> Result<()>;

    fn reserved_id(&self) -> u16;
}

/// Where a domain keeps its lock areas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainLeasePaths {
    /// Lockspace (host id) area.
    pub ids: PathBuf,
    /// Resource lease area; the SPM lease lives here.
    pub leases: PathBuf,
}

impl DomainLeasePaths {
    #[must_use]
    pub fn new(ids: impl Into<PathBuf>, leases: impl Into<PathBuf>) -> Self {
        Self {
            ids: ids.into(),
            leases: leases.into(),
        }
    }
}
