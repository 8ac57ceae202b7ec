//! Merge job: drives one subchain through validate, prepare, commit and
//! finalize, and decides when cancellation is allowed.
//!
//! Cancelling before the commit starts is safe. Base may already be ILLEGAL,
//! which is reversible by running the merge again from `validate`. Once the
//! external commit is running, cancellation is refused.

use std::{fmt, sync::Arc};

use strum::Display;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    image_tool::ImageTool,
    merge::{MergeCoordinator, SubchainInfo},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum JobPhase {
    Created,
    Validated,
    Prepared,
    Committing,
    Finalized,
    Aborted,
    Failed,
}

impl JobPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Aborted | Self::Failed)
    }
}

#[derive(Debug)]
struct JobState {
    phase: JobPhase,
    running: bool,
    cancel_requested: bool,
}

pub struct MergeJob {
    id: Uuid,
    subchain: SubchainInfo,
    coordinator: MergeCoordinator,
    image_tool: Arc<dyn ImageTool>,
    state: Mutex<JobState>,
}

impl fmt::Debug for MergeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeJob")
            .field("id", &self.id)
            .field("subchain", &self.subchain)
            .finish_non_exhaustive()
    }
}

impl MergeJob {
    #[must_use]
    pub fn new(
        subchain: SubchainInfo,
        coordinator: MergeCoordinator,
        image_tool: Arc<dyn ImageTool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subchain,
            coordinator,
            image_tool,
            state: Mutex::new(JobState {
                phase: JobPhase::Created,
                running: false,
                cancel_requested: false,
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn subchain(&self) -> &SubchainInfo {
        &self.subchain
    }

    pub async fn phase(&self) -> JobPhase {
        self.state.lock().await.phase
    }

    /// Request cancellation.
    ///
    /// # Errors
    ///
    /// - `CommitInProgress` while the external commit runs
    /// - `JobFinished` once the job reached a terminal phase
    pub async fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let phase = state.phase;
        match phase {
            JobPhase::Committing => Err(Error::CommitInProgress(self.id.to_string())),
            _ if phase.is_terminal() => Err(Error::JobFinished(self.id.to_string())),
            _ => {
                tracing::info!(job = %self.id, %phase, "Cancellation requested");
                state.cancel_requested = true;
                Ok(())
            }
        }
    }

    /// Run the job to completion. A job runs at most once.
    #[instrument(skip(self), fields(job = %self.id))]
    pub async fn run(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.phase.is_terminal() {
                return Err(Error::JobFinished(self.id.to_string()));
            }
            if state.running {
                return Err(Error::JobRunning(self.id.to_string()));
            }
            state.running = true;
        }

        let result = self.drive().await;
        if let Err(e) = &result {
            let mut state = self.state.lock().await;
            if state.phase != JobPhase::Aborted {
                state.phase = JobPhase::Failed;
            }
            tracing::warn!(phase = %state.phase, "Merge job did not complete: {e}");
        }
        result
    }

    async fn drive(&self) -> Result<()> {
        self.coordinator.validate(&self.subchain).await?;
        self.advance(JobPhase::Validated).await?;

        self.coordinator.prepare(&self.subchain).await?;
        self.advance(JobPhase::Prepared).await?;

        self.advance(JobPhase::Committing).await?;
        self.commit().await?;

        self.coordinator.finalize(&self.subchain).await?;
        self.state.lock().await.phase = JobPhase::Finalized;
        tracing::info!("Merge job finished");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let manifest = self.coordinator.manifest();
        let image = &self.subchain.image;
        let top = manifest.volume_path(image, &self.subchain.top);
        let base = manifest.volume_path(image, &self.subchain.base);
        self.image_tool.commit(&top, &base).await
    }

    /// Move to `next` unless cancellation was requested.
    async fn advance(&self, next: JobPhase) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cancel_requested {
            state.phase = JobPhase::Aborted;
            tracing::info!("Merge job aborted before {next}");
            return Err(Error::Cancelled(self.id.to_string()));
        }
        state.phase = next;
        Ok(())
    }
}
