//! Cluster lock contract: host-id idempotence, transparent reconnects,
//! single ownership, and SPM gating on a live host-id check.

mod common;

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{Harness, GIB};
use spm_core::{
    clusterlock::{
        DaemonResult, FileLeaseDaemon, LeaseDaemon, LeaseDaemonError, LeaseDisk, LeaseHandle,
        LeaseRegistration,
    },
    config::LockConfig,
    volume::VolumeFormat,
    ClusterLock, DaemonLease, DomainId, DomainLeasePaths, Error, HostId, Legality, Result,
    SpmRole, SpmStatus, SubchainInfo,
};
use tempfile::TempDir;

fn paths(dir: &TempDir) -> DomainLeasePaths {
    DomainLeasePaths::new(dir.path().join("ids"), dir.path().join("leases"))
}

fn daemon_lease(
    domain: DomainId,
    dir: &TempDir,
    daemon: Arc<dyn LeaseDaemon>,
) -> (DaemonLease, Arc<LeaseRegistration>) {
    let registration = LeaseRegistration::new(daemon);
    let lease = DaemonLease::new(
        domain,
        &paths(dir),
        &LockConfig::default(),
        Arc::clone(&registration),
    );
    (lease, registration)
}

/// Daemon that drops the connection on the first `drops` acquisitions.
struct FlakyDaemon {
    inner: FileLeaseDaemon,
    drops: AtomicU32,
}

impl FlakyDaemon {
    fn new(drops: u32) -> Self {
        Self {
            inner: FileLeaseDaemon::new(),
            drops: AtomicU32::new(drops),
        }
    }
}

#[async_trait::async_trait]
impl LeaseDaemon for FlakyDaemon {
    async fn register(&self) -> DaemonResult<LeaseHandle> {
        self.inner.register().await
    }

    async fn write_lockspace(
        &self,
        lockspace: &str,
        disk: &LeaseDisk,
        io_timeout: Duration,
    ) -> DaemonResult<()> {
        self.inner.write_lockspace(lockspace, disk, io_timeout).await
    }

    async fn write_resource(
        &self,
        lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()> {
        self.inner.write_resource(lockspace, resource, disk).await
    }

    async fn add_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        disk: &LeaseDisk,
        wait: bool,
    ) -> DaemonResult<()> {
        self.inner.add_lockspace(lockspace, host_id, disk, wait).await
    }

    async fn rem_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        disk: &LeaseDisk,
        wait: bool,
        unused: bool,
    ) -> DaemonResult<()> {
        self.inner
            .rem_lockspace(lockspace, host_id, disk, wait, unused)
            .await
    }

    async fn inq_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        disk: &LeaseDisk,
    ) -> DaemonResult<bool> {
        self.inner.inq_lockspace(lockspace, host_id, disk).await
    }

    async fn acquire(
        &self,
        handle: LeaseHandle,
        lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()> {
        let remaining = self.drops.load(Ordering::SeqCst);
        if remaining > 0 {
            self.drops.store(remaining - 1, Ordering::SeqCst);
            self.inner.disconnect().await;
            return Err(LeaseDaemonError::Disconnected);
        }
        self.inner.acquire(handle, lockspace, resource, disk).await
    }

    async fn release(
        &self,
        handle: LeaseHandle,
        lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()> {
        self.inner.release(handle, lockspace, resource, disk).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HOST ID
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_acquire_host_id_twice_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (lease, _) = daemon_lease(DomainId::new(), &dir, Arc::new(FileLeaseDaemon::new()));
    let host = HostId::new(3)?;

    lease.init_lock().await?;
    lease.acquire_host_id(host, false).await?;
    lease.acquire_host_id(host, false).await?;
    assert!(lease.has_host_id(host).await);

    lease.release_host_id(host, false, false).await?;
    lease.release_host_id(host, false, false).await?;
    assert!(!lease.has_host_id(host).await);
    Ok(())
}

#[tokio::test]
async fn test_init_lock_creates_lease_areas() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (lease, _) = daemon_lease(DomainId::new(), &dir, Arc::new(FileLeaseDaemon::new()));

    lease.init_lock().await?;

    assert!(dir.path().join("ids").exists());
    assert!(dir.path().join("leases").exists());
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ACQUIRE / RELEASE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_acquire_reregisters_after_disconnect() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let daemon = Arc::new(FileLeaseDaemon::new());
    let (lease, registration) = daemon_lease(DomainId::new(), &dir, daemon.clone());
    let host = HostId::new(1)?;
    lease.acquire_host_id(host, false).await?;

    let stale = registration.ensure().await?;
    daemon.disconnect().await;

    lease.acquire(host).await?;
    assert!(lease.is_held().await);
    let current = registration.current().await;
    assert!(current.is_some());
    assert_ne!(current, Some(stale));
    Ok(())
}

#[tokio::test]
async fn test_acquire_retries_through_dropped_connections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (lease, _) = daemon_lease(DomainId::new(), &dir, Arc::new(FlakyDaemon::new(2)));
    let host = HostId::new(1)?;
    lease.acquire_host_id(host, false).await?;

    lease.acquire(host).await?;
    assert!(lease.is_held().await);
    Ok(())
}

#[tokio::test]
async fn test_acquire_gives_up_after_max_reconnects() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let drops = LockConfig::default().max_reconnect_attempts;
    let (lease, _) = daemon_lease(DomainId::new(), &dir, Arc::new(FlakyDaemon::new(drops)));
    let host = HostId::new(1)?;
    lease.acquire_host_id(host, false).await?;

    let result = lease.acquire(host).await;
    assert!(matches!(result, Err(Error::AcquireLockFailure { .. })));
    assert!(!lease.is_held().await);
    Ok(())
}

#[tokio::test]
async fn test_acquire_without_host_id_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (lease, _) = daemon_lease(DomainId::new(), &dir, Arc::new(FileLeaseDaemon::new()));

    let result = lease.acquire(HostId::new(1)?).await;
    assert!(matches!(result, Err(Error::AcquireLockFailure { .. })));
    Ok(())
}

#[tokio::test]
async fn test_only_one_host_holds_the_lease() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let domain = DomainId::new();
    let (first, _) = daemon_lease(domain, &dir, Arc::new(FileLeaseDaemon::new()));
    let (second, _) = daemon_lease(domain, &dir, Arc::new(FileLeaseDaemon::new()));
    let (h1, h2) = (HostId::new(1)?, HostId::new(2)?);

    first.acquire_host_id(h1, false).await?;
    second.acquire_host_id(h2, false).await?;
    first.acquire(h1).await?;

    let contended = second.acquire(h2).await;
    assert!(matches!(contended, Err(Error::AcquireLockFailure { .. })));

    first.release().await?;
    assert!(!first.is_held().await);
    second.acquire(h2).await?;
    assert!(second.is_held().await);
    Ok(())
}

#[tokio::test]
async fn test_release_when_not_held_is_a_noop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (lease, _) = daemon_lease(DomainId::new(), &dir, Arc::new(FileLeaseDaemon::new()));
    lease.release().await?;
    assert!(!lease.is_held().await);
    Ok(())
}

#[tokio::test]
async fn test_release_after_disconnect_clears_ownership() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let daemon = Arc::new(FileLeaseDaemon::new());
    let (lease, registration) = daemon_lease(DomainId::new(), &dir, daemon.clone());
    let host = HostId::new(1)?;
    lease.acquire_host_id(host, false).await?;
    lease.acquire(host).await?;

    daemon.disconnect().await;
    lease.release().await?;

    assert!(!lease.is_held().await);
    assert!(registration.current().await.is_none());
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SPM ROLE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_spm_role_gates_merges_on_live_host_id() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let h = Harness::new(false);
    let ids = h
        .storage
        .linear_chain(h.image, &[(VolumeFormat::Raw, GIB), (VolumeFormat::Cow, GIB)])
        .await;
    let host = HostId::new(1)?;
    let request = SubchainInfo::new(h.domain, h.image, ids[0], ids[1], 0, host);

    let (lease, _) = daemon_lease(h.domain, &dir, Arc::new(FileLeaseDaemon::new()));
    let role = SpmRole::new(Arc::new(lease), host, h.coordinator.clone());

    let refused = role.prepare_merge(&request).await;
    assert!(matches!(refused, Err(Error::NotSpm(_))));
    assert_eq!(h.storage.writes().await, 0);

    role.start().await?;
    assert_eq!(role.status().await, SpmStatus::Spm);
    role.prepare_merge(&request).await?;
    assert_eq!(
        h.storage.metadata(&ids[0]).await.legality(),
        Legality::Illegal
    );

    // Losing the host id revokes the role even though the status says SPM.
    role.lock().release_host_id(host, false, false).await?;
    let revoked = role.finalize_merge(&request).await;
    assert!(matches!(revoked, Err(Error::NotSpm(_))));

    role.stop().await?;
    assert_eq!(role.status().await, SpmStatus::Free);
    assert!(!role.lock().is_held().await);
    Ok(())
}

#[tokio::test]
async fn test_failed_contention_returns_to_free() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let h = Harness::new(false);
    let (holder, _) = daemon_lease(h.domain, &dir, Arc::new(FileLeaseDaemon::new()));
    let (contender, _) = daemon_lease(h.domain, &dir, Arc::new(FileLeaseDaemon::new()));
    let (h1, h2) = (HostId::new(1)?, HostId::new(2)?);

    holder.acquire_host_id(h1, false).await?;
    holder.acquire(h1).await?;

    let role = SpmRole::new(Arc::new(contender), h2, h.coordinator.clone());
    let result = role.start().await;
    assert!(matches!(result, Err(Error::AcquireLockFailure { .. })));
    assert_eq!(role.status().await, SpmStatus::Free);
    Ok(())
}
