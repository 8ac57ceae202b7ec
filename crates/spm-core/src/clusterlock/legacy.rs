//! Legacy disk-lease cluster lock.
//!
//! An external helper takes and renews the lease block on the leases volume.
//! There is no lockspace, so host-id operations are no-ops.

use std::{path::PathBuf, time::Duration};

use tokio::sync::Mutex;
use tracing::instrument;

use super::{ClusterLock, DomainLeasePaths, LEGACY_RESERVED_ID};
use crate::{
    config::LockConfig,
    ids::{DomainId, HostId},
    process, Error, Result,
};

#[derive(Debug)]
pub struct LegacyLease {
    domain: DomainId,
    leases: PathBuf,
    helper: PathBuf,
    free_helper: PathBuf,
    renewal_interval: Duration,
    lease_time: Duration,
    io_timeout: Duration,
    fail_retries: u32,
    held: Mutex<bool>,
}

impl LegacyLease {
    #[must_use]
    pub fn new(domain: DomainId, paths: &DomainLeasePaths, config: &LockConfig) -> Self {
        Self {
            domain,
            leases: paths.leases.clone(),
            helper: config.legacy_helper.clone(),
            free_helper: config.legacy_free_helper.clone(),
            renewal_interval: config.renewal_interval(),
            lease_time: config.lease_time(),
            io_timeout: config.io_timeout(),
            fail_retries: config.fail_retries,
            held: Mutex::new(false),
        }
    }

    /// Helper arguments for taking the lease on behalf of `host_id`.
    #[must_use]
    pub fn start_args(&self, host_id: HostId) -> Vec<String> {
        vec![
            "start".to_string(),
            self.domain.to_string(),
            host_id.to_string(),
            self.renewal_interval.as_secs().to_string(),
            self.leases.display().to_string(),
            self.lease_time.as_millis().to_string(),
            self.io_timeout.as_millis().to_string(),
            self.fail_retries.to_string(),
            std::process::id().to_string(),
        ]
    }

    /// Upper bound on one acquisition: every retry may use a full I/O timeout.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.io_timeout
            .saturating_mul(self.fail_retries.saturating_add(1))
    }

    pub async fn is_held(&self) -> bool {
        *self.held.lock().await
    }
}

#[async_trait::async_trait]
impl ClusterLock for LegacyLease {
    fn domain(&self) -> DomainId {
        self.domain
    }

    async fn init_lock(&self) -> Result<()> {
        let _guard = self.held.lock().await;
        tokio::fs::metadata(&self.leases)
            .await
            .map(drop)
            .map_err(|e| Error::InitLockFailure {
                domain: self.domain,
                reason: format!("leases volume {}: {e}", self.leases.display()),
            })
    }

    async fn acquire_host_id(&self, _host_id: HostId, _is_async: bool) -> Result<()> {
        Ok(())
    }

    async fn release_host_id(
        &self,
        _host_id: HostId,
        _is_async: bool,
        _unused: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn has_host_id(&self, _host_id: HostId) -> bool {
        true
    }

    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn acquire(&self, host_id: HostId) -> Result<()> {
        let mut held = self.held.lock().await;
        tracing::info!("Acquiring cluster lock (host id {host_id})");
        process::run(
            &self.helper,
            self.start_args(host_id),
            Some(self.acquire_timeout()),
        )
        .await
        .map_err(|e| Error::acquire_lock_failure(self.domain, e.to_string()))?;
        *held = true;
        tracing::info!("Cluster lock acquired");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn release(&self) -> Result<()> {
        let mut held = self.held.lock().await;
        *held = false;
        match process::run(
            &self.free_helper,
            [self.domain.to_string()],
            Some(self.io_timeout),
        )
        .await
        {
            Ok(_) => tracing::info!("Cluster lock released"),
            Err(e) => tracing::warn!("Could not release cluster lock: {e}"),
        }
        Ok(())
    }

    fn reserved_id(&self) -> u16 {
        LEGACY_RESERVED_ID
    }
}
