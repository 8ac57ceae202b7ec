//! Domain manifest and chain-tracking boundaries.
//!
//! The merge coordinator never touches storage directly. It works through a
//! [`DomainManifest`] (volume lookup, metadata I/O, allocation) and reports
//! chain changes to a [`ChainTracker`]. Both are `async_trait` seams so
//! production backends and in-memory test doubles are interchangeable.

use std::{collections::HashSet, path::PathBuf};

use crate::{
    ids::{DomainId, ImageId, VolumeId},
    volume::{Volume, VolumeMetadata},
    Result,
};

/// Persistence boundary for one storage domain.
#[async_trait::async_trait]
pub trait DomainManifest: Send + Sync {
    fn domain_id(&self) -> DomainId;

    /// On-disk format version; selects metadata serialization rules.
    fn version(&self) -> u32;

    /// Block-backed domains cannot grow a volume while it is being written.
    fn is_block(&self) -> bool;

    /// All volumes of an image, root first.
    async fn image_chain(&self, image: &ImageId) -> Result<Vec<Volume>>;

    async fn read_metadata(&self, image: &ImageId, volume: &VolumeId) -> Result<VolumeMetadata>;

    /// Persist metadata. Implementations serialize with
    /// [`VolumeMetadata::serialize`] and must write nothing when it fails.
    async fn write_metadata(
        &self,
        image: &ImageId,
        volume: &VolumeId,
        metadata: &VolumeMetadata,
    ) -> Result<()>;

    /// Physical allocation in bytes.
    async fn allocation(&self, image: &ImageId, volume: &VolumeId) -> Result<u64>;

    /// Grow the physical allocation to `size` bytes.
    async fn extend(&self, image: &ImageId, volume: &VolumeId, size: u64) -> Result<()>;

    /// Grow the image's virtual size to `capacity` bytes.
    async fn resize_image(&self, image: &ImageId, volume: &VolumeId, capacity: u64)
        -> Result<()>;

    /// Point `child`'s copy-on-write backing reference at `backing`.
    async fn rebase(&self, image: &ImageId, child: &VolumeId, backing: &VolumeId) -> Result<()>;

    fn volume_path(&self, image: &ImageId, volume: &VolumeId) -> PathBuf;
}

/// Receiver of authoritative chain changes (e.g. the running VM's drive).
#[async_trait::async_trait]
pub trait ChainTracker: Send + Sync {
    /// `chain` is the image's chain after the change, root first.
    async fn chain_updated(
        &self,
        domain: &DomainId,
        image: &ImageId,
        chain: &[VolumeId],
    ) -> Result<()>;
}

/// Tracker for hosts with no chain consumers; records the change in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingChainTracker;

#[async_trait::async_trait]
impl ChainTracker for LoggingChainTracker {
    async fn chain_updated(
        &self,
        domain: &DomainId,
        image: &ImageId,
        chain: &[VolumeId],
    ) -> Result<()> {
        tracing::info!(%domain, %image, ?chain, "Volume chain updated");
        Ok(())
    }
}

/// Order volumes so every parent precedes its children.
///
/// Volumes whose parent is absent from the set are treated as roots.
/// Siblings are ordered by id to keep the output deterministic.
#[must_use]
pub fn sort_chain(mut volumes: Vec<Volume>) -> Vec<Volume> {
    volumes.sort_by_key(|v| v.id);
    let present: HashSet<VolumeId> = volumes.iter().map(|v| v.id).collect();
    let mut emitted: HashSet<VolumeId> = HashSet::with_capacity(volumes.len());
    let mut ordered = Vec::with_capacity(volumes.len());

    while !volumes.is_empty() {
        let ready = volumes.iter().position(|v| {
            v.parent()
                .map_or(true, |p| !present.contains(p) || emitted.contains(p))
        });
        // A cycle leaves nothing ready; emit the remainder as-is.
        let index = ready.unwrap_or(0);
        let volume = volumes.remove(index);
        emitted.insert(volume.id);
        ordered.push(volume);
    }
    ordered
}
