//! Command handlers: wire config and arguments into a domain, a cluster lock
//! and an SPM role, then run the requested command.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use serde::Serialize;
use spm_core::{
    clusterlock::{FileLeaseDaemon, LeaseRegistration},
    file_domain::FileDomain,
    image_tool::{ImageTool, QemuImg},
    load_config,
    manifest::LoggingChainTracker,
    resource::LocalResourceManager,
    ClusterLock, Config, DaemonLease, DomainId, DomainLeasePaths, HostId, LegacyLease, LockKind,
    MergeCoordinator, SpmRole, SubchainInfo,
};
use uuid::Uuid;

use crate::{Cli, Commands, DomainArgs};

pub(crate) async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref()).await?;
    tracing::debug!(lock = %config.lock.kind, "Configuration loaded");

    match cli.command {
        Commands::Run { domain, init } => {
            let domain = Domain::open(&domain, &config)?;
            match config.lock.kind {
                LockKind::LeaseDaemon => {
                    hold_spm(domain.role(domain.daemon_lock(&config)), init).await
                }
                LockKind::Legacy => hold_spm(domain.role(domain.legacy_lock(&config)), init).await,
            }
        }
        Commands::Merge { domain, request } => {
            let request = read_request(&request).await?;
            let domain = Domain::open(&domain, &config)?;
            let tool = Arc::clone(&domain.image_tool);
            match config.lock.kind {
                LockKind::LeaseDaemon => {
                    merge_once(domain.role(domain.daemon_lock(&config)), request, tool).await
                }
                LockKind::Legacy => {
                    merge_once(domain.role(domain.legacy_lock(&config)), request, tool).await
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WIRING
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Domain {
    id: DomainId,
    host_id: HostId,
    paths: DomainLeasePaths,
    image_tool: Arc<dyn ImageTool>,
    coordinator: MergeCoordinator,
}

impl Domain {
    fn open(args: &DomainArgs, config: &Config) -> Result<Self> {
        let host_id = HostId::new(args.host_id)?;
        let image_tool: Arc<dyn ImageTool> =
            Arc::new(QemuImg::new(config.commit.qemu_img.clone()));
        let storage = FileDomain::new(
            &args.root,
            args.domain,
            args.version,
            Arc::clone(&image_tool),
        )
        .with_block_semantics(args.block);
        let coordinator = MergeCoordinator::new(
            Arc::new(storage),
            Arc::new(LocalResourceManager::new(config.storage.resource_timeout())),
            Arc::new(LoggingChainTracker),
        )
        .with_extent_size(config.storage.extent_size());

        Ok(Self {
            id: args.domain,
            host_id,
            paths: DomainLeasePaths::new(&args.ids, &args.leases),
            image_tool,
            coordinator,
        })
    }

    fn daemon_lock(&self, config: &Config) -> DaemonLease {
        let registration = LeaseRegistration::new(Arc::new(FileLeaseDaemon::new()));
        DaemonLease::new(self.id, &self.paths, &config.lock, registration)
    }

    fn legacy_lock(&self, config: &Config) -> LegacyLease {
        LegacyLease::new(self.id, &self.paths, &config.lock)
    }

    fn role<L: ClusterLock>(&self, lock: L) -> SpmRole<L> {
        SpmRole::new(Arc::new(lock), self.host_id, self.coordinator.clone())
    }
}

async fn read_request(path: &Path) -> Result<SubchainInfo> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read merge request {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Invalid merge request {}", path.display()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// COMMANDS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn hold_spm<L: ClusterLock>(role: SpmRole<L>, init: bool) -> Result<()> {
    if init {
        role.lock().init_lock().await?;
    }
    role.start().await?;
    tracing::info!(
        domain = %role.domain(),
        host = %role.host_id(),
        "Holding SPM role until interrupted"
    );

    let waited = shutdown_signal().await;
    step_down(&role).await;
    waited
}

/// Outcome of a one-shot merge, printed as a single JSON line.
#[derive(Debug, Serialize)]
struct MergeReport {
    job: Uuid,
    phase: String,
    subchain: SubchainInfo,
    error: Option<String>,
}

async fn merge_once<L: ClusterLock>(
    role: SpmRole<L>,
    request: SubchainInfo,
    image_tool: Arc<dyn ImageTool>,
) -> Result<()> {
    role.start().await?;
    let job = match role.merge_job(request, image_tool).await {
        Ok(job) => job,
        Err(e) => {
            step_down(&role).await;
            return Err(e.into());
        }
    };

    let outcome = job.run().await;
    step_down(&role).await;

    let report = MergeReport {
        job: job.id(),
        phase: job.phase().await.to_string(),
        subchain: job.subchain().clone(),
        error: outcome.as_ref().err().map(ToString::to_string),
    };
    #[allow(clippy::print_stdout)]
    {
        println!("{}", serde_json::to_string(&report)?);
    }
    outcome.map_err(Into::into)
}

/// Release the SPM lease and the host id. Failures are logged only; the
/// leases expire on their own.
async fn step_down<L: ClusterLock>(role: &SpmRole<L>) {
    if let Err(e) = role.stop().await {
        tracing::warn!("Failed to release SPM lease: {e}");
    }
    if let Err(e) = role
        .lock()
        .release_host_id(role.host_id(), false, false)
        .await
    {
        tracing::warn!("Failed to release host id: {e}");
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM")?;
        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT, stepping down"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, stepping down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl-C")?;
        tracing::info!("Received Ctrl-C, stepping down");
    }

    Ok(())
}
