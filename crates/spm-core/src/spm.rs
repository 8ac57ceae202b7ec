//! SPM role of one host on one storage domain.
//!
//! Structural metadata changes are only accepted while this host holds the
//! SPM lease. Every merge entry point rechecks the lockspace registration
//! live before doing anything.

use std::sync::Arc;

use strum::Display;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::{
    clusterlock::ClusterLock,
    ids::{DomainId, HostId},
    image_tool::ImageTool,
    job::MergeJob,
    merge::{MergeCoordinator, SubchainInfo},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SpmStatus {
    Free,
    Contending,
    Spm,
}

#[derive(Debug)]
pub struct SpmRole<L: ClusterLock> {
    lock: Arc<L>,
    host_id: HostId,
    coordinator: MergeCoordinator,
    status: Mutex<SpmStatus>,
}

impl<L: ClusterLock> SpmRole<L> {
    #[must_use]
    pub fn new(lock: Arc<L>, host_id: HostId, coordinator: MergeCoordinator) -> Self {
        Self {
            lock,
            host_id,
            coordinator,
            status: Mutex::new(SpmStatus::Free),
        }
    }

    #[must_use]
    pub fn domain(&self) -> DomainId {
        self.lock.domain()
    }

    #[must_use]
    pub const fn host_id(&self) -> HostId {
        self.host_id
    }

    #[must_use]
    pub fn lock(&self) -> &L {
        &self.lock
    }

    pub async fn status(&self) -> SpmStatus {
        *self.status.lock().await
    }

    /// Contend for the SPM role. Any failure returns the role to `Free`.
    #[instrument(skip(self), fields(domain = %self.domain(), host = %self.host_id))]
    pub async fn start(&self) -> Result<()> {
        let mut status = self.status.lock().await;
        if *status == SpmStatus::Spm {
            return Ok(());
        }
        *status = SpmStatus::Contending;

        let contended = async {
            self.lock.acquire_host_id(self.host_id, false).await?;
            self.lock.acquire(self.host_id).await
        }
        .await;

        match contended {
            Ok(()) => {
                *status = SpmStatus::Spm;
                tracing::info!("Host is now SPM");
                Ok(())
            }
            Err(e) => {
                *status = SpmStatus::Free;
                tracing::warn!("Could not become SPM: {e}");
                Err(e)
            }
        }
    }

    /// Give up the SPM role.
    #[instrument(skip(self), fields(domain = %self.domain(), host = %self.host_id))]
    pub async fn stop(&self) -> Result<()> {
        let mut status = self.status.lock().await;
        *status = SpmStatus::Free;
        let released = self.lock.release().await;
        tracing::info!("Host is no longer SPM");
        released
    }

    pub async fn prepare_merge(&self, subchain: &SubchainInfo) -> Result<()> {
        self.ensure_spm().await?;
        self.coordinator.prepare(subchain).await
    }

    pub async fn finalize_merge(&self, subchain: &SubchainInfo) -> Result<()> {
        self.ensure_spm().await?;
        self.coordinator.finalize(subchain).await
    }

    /// Create a merge job. Only the SPM may create one.
    pub async fn merge_job(
        &self,
        subchain: SubchainInfo,
        image_tool: Arc<dyn ImageTool>,
    ) -> Result<MergeJob> {
        self.ensure_spm().await?;
        Ok(MergeJob::new(subchain, self.coordinator.clone(), image_tool))
    }

    async fn ensure_spm(&self) -> Result<()> {
        let status = self.status().await;
        if status == SpmStatus::Spm && self.lock.has_host_id(self.host_id).await {
            Ok(())
        } else {
            Err(Error::NotSpm(self.domain()))
        }
    }
}
