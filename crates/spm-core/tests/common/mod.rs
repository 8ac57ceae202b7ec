//! Shared fixtures for spm-core integration tests.
//!
//! Integration tests need relaxed clippy settings; not every test binary
//! uses every fixture.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::significant_drop_tightening
)]

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use spm_core::{
    image_tool::ImageTool,
    manifest::{sort_chain, ChainTracker, DomainManifest},
    resource::LocalResourceManager,
    volume::{VolumeFormat, VolumeType},
    DomainId, Error, ImageId, MergeCoordinator, Result, Volume, VolumeId, VolumeMetadata,
};
use tokio::sync::Mutex;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// IN-MEMORY DOMAIN
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct MemoryState {
    pub volumes: BTreeMap<VolumeId, VolumeMetadata>,
    pub allocations: HashMap<VolumeId, u64>,
    pub rebases: Vec<(VolumeId, VolumeId)>,
    pub resizes: Vec<(VolumeId, u64)>,
    pub writes: usize,
    pub fail_rebase: bool,
}

/// Storage domain kept entirely in memory, recording every mutation.
#[derive(Debug)]
pub struct MemoryDomain {
    domain: DomainId,
    block: bool,
    pub state: Mutex<MemoryState>,
}

impl MemoryDomain {
    pub fn new(domain: DomainId, block: bool) -> Self {
        Self {
            domain,
            block,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn insert(&self, id: VolumeId, metadata: VolumeMetadata, allocation: u64) {
        let mut state = self.state.lock().await;
        state.volumes.insert(id, metadata);
        state.allocations.insert(id, allocation);
    }

    pub async fn metadata(&self, id: &VolumeId) -> VolumeMetadata {
        self.state.lock().await.volumes[id].clone()
    }

    pub async fn allocation_of(&self, id: &VolumeId) -> u64 {
        self.state.lock().await.allocations[id]
    }

    pub async fn writes(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn rebases(&self) -> Vec<(VolumeId, VolumeId)> {
        self.state.lock().await.rebases.clone()
    }

    pub async fn resizes(&self) -> Vec<(VolumeId, u64)> {
        self.state.lock().await.resizes.clone()
    }

    pub async fn fail_rebases(&self, fail: bool) {
        self.state.lock().await.fail_rebase = fail;
    }

    /// Build a linear chain root first; each entry is `(format, capacity)`.
    /// Every volume is allocated at its full capacity.
    pub async fn linear_chain(
        &self,
        image: ImageId,
        volumes: &[(VolumeFormat, u64)],
    ) -> Vec<VolumeId> {
        let mut ids: Vec<VolumeId> = Vec::with_capacity(volumes.len());
        for (index, &(format, capacity)) in volumes.iter().enumerate() {
            let mut md = VolumeMetadata::new(self.domain, image, 0, format);
            md.set_capacity_bytes(capacity);
            if let Some(parent) = ids.last() {
                md.parent = Some(*parent);
            }
            if index + 1 < volumes.len() {
                md.voltype = VolumeType::Internal;
            }
            let id = VolumeId::new();
            self.insert(id, md, capacity).await;
            ids.push(id);
        }
        ids
    }
}

fn missing(volume: &VolumeId) -> Error {
    Error::io(format!("Volume {volume}"), "not found")
}

#[async_trait::async_trait]
impl DomainManifest for MemoryDomain {
    fn domain_id(&self) -> DomainId {
        self.domain
    }

    fn version(&self) -> u32 {
        5
    }

    fn is_block(&self) -> bool {
        self.block
    }

    async fn image_chain(&self, image: &ImageId) -> Result<Vec<Volume>> {
        let state = self.state.lock().await;
        let volumes = state
            .volumes
            .iter()
            .filter(|(_, md)| md.image == *image)
            .map(|(id, md)| Volume::new(*id, md.clone()))
            .collect();
        Ok(sort_chain(volumes))
    }

    async fn read_metadata(&self, _image: &ImageId, volume: &VolumeId) -> Result<VolumeMetadata> {
        let state = self.state.lock().await;
        state.volumes.get(volume).cloned().ok_or_else(|| missing(volume))
    }

    async fn write_metadata(
        &self,
        _image: &ImageId,
        volume: &VolumeId,
        metadata: &VolumeMetadata,
    ) -> Result<()> {
        metadata.serialize(self.version(), &BTreeMap::new())?;
        let mut state = self.state.lock().await;
        state.volumes.insert(*volume, metadata.clone());
        state.writes += 1;
        Ok(())
    }

    async fn allocation(&self, _image: &ImageId, volume: &VolumeId) -> Result<u64> {
        let state = self.state.lock().await;
        state.allocations.get(volume).copied().ok_or_else(|| missing(volume))
    }

    async fn extend(&self, _image: &ImageId, volume: &VolumeId, size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let current = state.allocations.entry(*volume).or_default();
        *current = (*current).max(size);
        Ok(())
    }

    async fn resize_image(&self, _image: &ImageId, volume: &VolumeId, capacity: u64) -> Result<()> {
        self.state.lock().await.resizes.push((*volume, capacity));
        Ok(())
    }

    async fn rebase(&self, _image: &ImageId, child: &VolumeId, backing: &VolumeId) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_rebase {
            return Err(Error::CommandFailed {
                command: "rebase".to_string(),
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        state.rebases.push((*child, *backing));
        Ok(())
    }

    fn volume_path(&self, image: &ImageId, volume: &VolumeId) -> PathBuf {
        PathBuf::from(format!("/memory/{image}/{volume}"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RECORDERS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct RecordingTracker {
    pub updates: Mutex<Vec<Vec<VolumeId>>>,
}

#[async_trait::async_trait]
impl ChainTracker for RecordingTracker {
    async fn chain_updated(
        &self,
        _domain: &DomainId,
        _image: &ImageId,
        chain: &[VolumeId],
    ) -> Result<()> {
        self.updates.lock().await.push(chain.to_vec());
        Ok(())
    }
}

/// Image tool that records commits and can hold a commit open until
/// released, so tests can observe the COMMITTING phase.
#[derive(Debug, Default)]
pub struct RecordingImageTool {
    pub commits: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub gate: Option<Arc<tokio::sync::Notify>>,
    pub started: Option<Arc<tokio::sync::Notify>>,
}

impl RecordingImageTool {
    pub fn gated() -> (Self, Arc<tokio::sync::Notify>, Arc<tokio::sync::Notify>) {
        let gate = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(tokio::sync::Notify::new());
        let tool = Self {
            commits: Mutex::new(Vec::new()),
            gate: Some(Arc::clone(&gate)),
            started: Some(Arc::clone(&started)),
        };
        (tool, gate, started)
    }
}

#[async_trait::async_trait]
impl ImageTool for RecordingImageTool {
    async fn commit(&self, top: &Path, base: &Path) -> Result<()> {
        if let Some(started) = &self.started {
            started.notify_one();
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.commits
            .lock()
            .await
            .push((top.to_path_buf(), base.to_path_buf()));
        Ok(())
    }

    async fn rebase(&self, _child: &Path, _backing: &Path, _format: VolumeFormat) -> Result<()> {
        Ok(())
    }

    async fn resize(&self, _path: &Path, _format: VolumeFormat, _size: u64) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HARNESS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Harness {
    pub domain: DomainId,
    pub image: ImageId,
    pub storage: Arc<MemoryDomain>,
    pub tracker: Arc<RecordingTracker>,
    pub coordinator: MergeCoordinator,
}

impl Harness {
    pub fn new(block: bool) -> Self {
        let domain = DomainId::new();
        let storage = Arc::new(MemoryDomain::new(domain, block));
        let tracker = Arc::new(RecordingTracker::default());
        let coordinator = MergeCoordinator::new(
            Arc::clone(&storage) as Arc<dyn DomainManifest>,
            Arc::new(LocalResourceManager::new(Duration::from_secs(5))),
            Arc::clone(&tracker) as Arc<dyn ChainTracker>,
        );
        Self {
            domain,
            image: ImageId::new(),
            storage,
            tracker,
            coordinator,
        }
    }
}
