//! Lease-daemon backed cluster lock.
//!
//! The daemon connection handle is a privileged, process-wide registration.
//! [`LeaseRegistration`] owns it behind its own mutex and is shared by every
//! [`DaemonLease`] in the process. A disconnect invalidates the handle; the
//! next `ensure()` registers again.

use std::{path::PathBuf, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

use super::{ClusterLock, DomainLeasePaths, DAEMON_RESERVED_ID};
use crate::{
    config::LockConfig,
    ids::{DomainId, HostId},
    Error, Result,
};

/// Errors reported by the lease daemon binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseDaemonError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("operation in progress")]
    InProgress,
    #[error("connection to lease daemon lost")]
    Disconnected,
    #[error("resource is held by another host")]
    Conflict,
    #[error("{0}")]
    Io(String),
}

pub type DaemonResult<T> = std::result::Result<T, LeaseDaemonError>;

impl From<LeaseDaemonError> for Error {
    fn from(err: LeaseDaemonError) -> Self {
        Self::IoError(format!("lease daemon: {err}"))
    }
}

/// Token of one daemon registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseHandle(u64);

impl LeaseHandle {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// A lease area: a path and a byte offset inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseDisk {
    pub path: PathBuf,
    pub offset: u64,
}

impl LeaseDisk {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }
}

/// Binding to the lease subsystem.
#[async_trait::async_trait]
pub trait LeaseDaemon: Send + Sync {
    /// Open a client registration.
    async fn register(&self) -> DaemonResult<LeaseHandle>;

    async fn write_lockspace(
        &self,
        lockspace: &str,
        disk: &LeaseDisk,
        io_timeout: Duration,
    ) -> DaemonResult<()>;

    async fn write_resource(
        &self,
        lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()>;

    /// Join a lockspace. With `wait == false` the daemon may report
    /// `InProgress` while the join completes in the background.
    async fn add_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        disk: &LeaseDisk,
        wait: bool,
    ) -> DaemonResult<()>;

    async fn rem_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        disk: &LeaseDisk,
        wait: bool,
        unused: bool,
    ) -> DaemonResult<()>;

    async fn inq_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        disk: &LeaseDisk,
    ) -> DaemonResult<bool>;

    async fn acquire(
        &self,
        handle: LeaseHandle,
        lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()>;

    async fn release(
        &self,
        handle: LeaseHandle,
        lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REGISTRATION
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The process-wide daemon registration.
pub struct LeaseRegistration {
    daemon: Arc<dyn LeaseDaemon>,
    handle: Mutex<Option<LeaseHandle>>,
}

impl std::fmt::Debug for LeaseRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRegistration").finish_non_exhaustive()
    }
}

impl LeaseRegistration {
    #[must_use]
    pub fn new(daemon: Arc<dyn LeaseDaemon>) -> Arc<Self> {
        Arc::new(Self {
            daemon,
            handle: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn daemon(&self) -> &dyn LeaseDaemon {
        self.daemon.as_ref()
    }

    /// Return the live handle, registering first if there is none.
    pub async fn ensure(&self) -> DaemonResult<LeaseHandle> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = *slot {
            return Ok(handle);
        }
        let handle = self.daemon.register().await?;
        tracing::debug!("Registered with lease daemon, handle {}", handle.get());
        *slot = Some(handle);
        Ok(handle)
    }

    /// Forget `stale` so the next `ensure()` registers again.
    ///
    /// A handle already replaced by another caller is left alone.
    pub async fn invalidate(&self, stale: LeaseHandle) {
        let mut slot = self.handle.lock().await;
        if *slot == Some(stale) {
            *slot = None;
        }
    }

    pub async fn current(&self) -> Option<LeaseHandle> {
        *self.handle.lock().await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DAEMON LEASE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cluster lock backed by the lease daemon.
#[derive(Debug)]
pub struct DaemonLease {
    domain: DomainId,
    lockspace: String,
    ids: LeaseDisk,
    spm: LeaseDisk,
    resource: String,
    io_timeout: Duration,
    max_reconnect_attempts: u32,
    registration: Arc<LeaseRegistration>,
    /// Per-domain lock; also records the handle the SPM lease was taken on.
    held: Mutex<Option<LeaseHandle>>,
}

impl DaemonLease {
    #[must_use]
    pub fn new(
        domain: DomainId,
        paths: &DomainLeasePaths,
        config: &LockConfig,
        registration: Arc<LeaseRegistration>,
    ) -> Self {
        Self {
            domain,
            lockspace: domain.to_string(),
            ids: LeaseDisk::new(&paths.ids, 0),
            spm: LeaseDisk::new(&paths.leases, config.spm_lease_offset),
            resource: config.spm_lease_name.clone(),
            io_timeout: config.io_timeout(),
            max_reconnect_attempts: config.max_reconnect_attempts.max(1),
            registration,
            held: Mutex::new(None),
        }
    }

    fn daemon(&self) -> &dyn LeaseDaemon {
        self.registration.daemon()
    }

    /// Whether this process believes it holds the SPM lease.
    pub async fn is_held(&self) -> bool {
        self.held.lock().await.is_some()
    }
}

#[async_trait::async_trait]
impl ClusterLock for DaemonLease {
    fn domain(&self) -> DomainId {
        self.domain
    }

    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn init_lock(&self) -> Result<()> {
        let _guard = self.held.lock().await;
        let init_failure = |e: LeaseDaemonError| Error::InitLockFailure {
            domain: self.domain,
            reason: e.to_string(),
        };
        self.daemon()
            .write_lockspace(&self.lockspace, &self.ids, self.io_timeout)
            .await
            .map_err(init_failure)?;
        self.daemon()
            .write_resource(&self.lockspace, &self.resource, &self.spm)
            .await
            .map_err(init_failure)?;
        tracing::info!("Initialized lock areas");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn acquire_host_id(&self, host_id: HostId, is_async: bool) -> Result<()> {
        let _guard = self.held.lock().await;
        match self
            .daemon()
            .add_lockspace(&self.lockspace, host_id, &self.ids, !is_async)
            .await
        {
            Ok(()) => {
                tracing::info!("Host id {host_id} acquired");
                Ok(())
            }
            Err(LeaseDaemonError::AlreadyExists) => {
                tracing::debug!("Host id {host_id} already acquired");
                Ok(())
            }
            Err(LeaseDaemonError::InProgress) if is_async => {
                tracing::debug!("Host id {host_id} acquisition in progress");
                Ok(())
            }
            Err(e) => Err(Error::AcquireHostIdFailure {
                domain: self.domain,
                reason: e.to_string(),
            }),
        }
    }

    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn release_host_id(&self, host_id: HostId, is_async: bool, unused: bool) -> Result<()> {
        let _guard = self.held.lock().await;
        match self
            .daemon()
            .rem_lockspace(&self.lockspace, host_id, &self.ids, !is_async, unused)
            .await
        {
            Ok(()) => {
                tracing::info!("Host id {host_id} released");
                Ok(())
            }
            Err(LeaseDaemonError::NotFound) => {
                tracing::debug!("Host id {host_id} was not acquired");
                Ok(())
            }
            Err(e) => Err(Error::ReleaseHostIdFailure {
                domain: self.domain,
                reason: e.to_string(),
            }),
        }
    }

    async fn has_host_id(&self, host_id: HostId) -> bool {
        match self
            .daemon()
            .inq_lockspace(&self.lockspace, host_id, &self.ids)
            .await
        {
            Ok(present) => present,
            Err(e) => {
                tracing::debug!(domain = %self.domain, "Host id {host_id} check failed: {e}");
                false
            }
        }
    }

    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn acquire(&self, host_id: HostId) -> Result<()> {
        let mut held = self.held.lock().await;
        tracing::info!("Acquiring cluster lock {} (host id {host_id})", self.resource);

        for attempt in 1..=self.max_reconnect_attempts {
            let handle = match self.registration.ensure().await {
                Ok(handle) => handle,
                Err(LeaseDaemonError::Disconnected) => {
                    tracing::warn!(attempt, "Lease daemon unavailable, retrying registration");
                    continue;
                }
                Err(e) => return Err(Error::acquire_lock_failure(self.domain, e.to_string())),
            };

            match self
                .daemon()
                .acquire(handle, &self.lockspace, &self.resource, &self.spm)
                .await
            {
                Ok(()) => {
                    *held = Some(handle);
                    tracing::info!("Cluster lock {} acquired", self.resource);
                    return Ok(());
                }
                Err(LeaseDaemonError::Disconnected) => {
                    tracing::warn!(attempt, "Lease daemon connection lost, re-registering");
                    self.registration.invalidate(handle).await;
                }
                Err(e) => return Err(Error::acquire_lock_failure(self.domain, e.to_string())),
            }
        }

        Err(Error::acquire_lock_failure(
            self.domain,
            format!(
                "lease daemon disconnected {} times",
                self.max_reconnect_attempts
            ),
        ))
    }

    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn release(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        let Some(handle) = held.take() else {
            tracing::debug!("Cluster lock {} is not held", self.resource);
            return Ok(());
        };

        match self
            .daemon()
            .release(handle, &self.lockspace, &self.resource, &self.spm)
            .await
        {
            Ok(()) => {
                tracing::info!("Cluster lock {} released", self.resource);
                Ok(())
            }
            Err(LeaseDaemonError::Disconnected) => {
                // A dead registration holds no leases.
                self.registration.invalidate(handle).await;
                tracing::warn!("Lease daemon connection lost, lease dropped with it");
                Ok(())
            }
            Err(e) => Err(Error::ReleaseLockFailure {
                domain: self.domain,
                reason: e.to_string(),
            }),
        }
    }

    fn reserved_id(&self) -> u16 {
        DAEMON_RESERVED_ID
    }
}
