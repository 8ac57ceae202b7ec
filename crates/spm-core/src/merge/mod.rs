//! # Merge Coordinator
//!
//! Collapses a contiguous `base..top` run of a copy-on-write chain into base.
//!
//! ```text
//! CREATED ──validate──▶ VALIDATED ──prepare──▶ PREPARED ──(commit)──▶ ... ──finalize──▶ FINALIZED
//! ```
//!
//! `prepare` marks base ILLEGAL before anything else touches it, and
//! `finalize` restores LEGAL as its very last write. Between the two, base is
//! visibly degraded: a failure leaves it ILLEGAL for a retried `finalize` or
//! an operator, never silently repaired.
//!
//! Legality only changes through a [`LegalityTransition`], which can only be
//! minted in this module.

mod subchain;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::instrument;

pub use subchain::SubchainInfo;

use crate::{
    ids::VolumeId,
    manifest::{ChainTracker, DomainManifest},
    resource::{acquire_all, HeldLocks, LockPlan, ResourceManager},
    volume::{Legality, Volume, VolumeFormat, VolumeMetadata, VolumeType},
    Error, Result,
};

/// Default block-storage extent size (128 MiB).
pub const DEFAULT_EXTENT_SIZE: u64 = 128 * MIB;

const MIB: u64 = 1024 * 1024;

/// COW cluster size used for worst-case allocation estimates.
const COW_CLUSTER_SIZE: u64 = 64 * 1024;

/// Header, L1 table and bitmap reserve of a COW image.
const COW_METADATA_RESERVE: u64 = MIB;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LEGALITY TRANSITIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Permission to change a volume's legality.
///
/// Only `prepare` (mark ILLEGAL) and `finalize` (restore LEGAL, bump the
/// generation) can create one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegalityTransition {
    target: Legality,
    bump_generation: bool,
}

impl LegalityTransition {
    const fn begin_merge() -> Self {
        Self {
            target: Legality::Illegal,
            bump_generation: false,
        }
    }

    const fn commit_merge() -> Self {
        Self {
            target: Legality::Legal,
            bump_generation: true,
        }
    }

    #[must_use]
    pub const fn target(&self) -> Legality {
        self.target
    }

    #[must_use]
    pub const fn bumps_generation(&self) -> bool {
        self.bump_generation
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SIZING
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Worst-case physical size of a fully allocated image, rounded up to
/// whole extents.
#[must_use]
pub fn max_allocation(format: VolumeFormat, capacity: u64, extent_size: u64) -> u64 {
    let size = match format {
        VolumeFormat::Raw => capacity,
        VolumeFormat::Cow => {
            let clusters = capacity.div_ceil(COW_CLUSTER_SIZE);
            // 8-byte L2 entry and 2-byte refcount entry per cluster.
            capacity
                .saturating_add(clusters.saturating_mul(10))
                .saturating_add(COW_METADATA_RESERVE)
        }
    };
    let extent = extent_size.max(1);
    size.div_ceil(extent).saturating_mul(extent)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// COORDINATOR
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs the validate, prepare and finalize steps of a chain merge.
#[derive(Clone)]
pub struct MergeCoordinator {
    manifest: Arc<dyn DomainManifest>,
    resources: Arc<dyn ResourceManager>,
    tracker: Arc<dyn ChainTracker>,
    extent_size: u64,
}

impl std::fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("domain", &self.manifest.domain_id())
            .field("extent_size", &self.extent_size)
            .finish_non_exhaustive()
    }
}

impl MergeCoordinator {
    #[must_use]
    pub fn new(
        manifest: Arc<dyn DomainManifest>,
        resources: Arc<dyn ResourceManager>,
        tracker: Arc<dyn ChainTracker>,
    ) -> Self {
        Self {
            manifest,
            resources,
            tracker,
            extent_size: DEFAULT_EXTENT_SIZE,
        }
    }

    #[must_use]
    pub fn with_extent_size(mut self, extent_size: u64) -> Self {
        self.extent_size = extent_size;
        self
    }

    #[must_use]
    pub fn manifest(&self) -> &Arc<dyn DomainManifest> {
        &self.manifest
    }

    /// Check a merge request against the live chain without side effects.
    pub async fn validate(&self, subchain: &SubchainInfo) -> Result<Vec<VolumeId>> {
        self.check_domain(subchain)?;
        let chain = self.manifest.image_chain(&subchain.image).await?;
        let span = subchain.validate(&chain)?;
        Ok(span.iter().map(|v| v.id).collect())
    }

    /// Mark base ILLEGAL and size it for the commit.
    ///
    /// Locks are released before returning, on success and on failure. A
    /// failure after the ILLEGAL marker was written leaves it in place.
    #[instrument(skip_all, fields(subchain = %subchain))]
    pub async fn prepare(&self, subchain: &SubchainInfo) -> Result<()> {
        let locks = self.lock(subchain).await?;
        let chain = self.manifest.image_chain(&subchain.image).await?;
        let span = subchain.validate(&chain)?;

        let mut base = self
            .manifest
            .read_metadata(&subchain.image, &subchain.base)
            .await?;
        if base.generation() != subchain.base_generation {
            return Err(Error::GenerationMismatch {
                volume: subchain.base,
                expected: subchain.base_generation,
                actual: base.generation(),
            });
        }

        base.apply(&LegalityTransition::begin_merge());
        self.manifest
            .write_metadata(&subchain.image, &subchain.base, &base)
            .await?;
        tracing::info!("Marked base volume {} ILLEGAL", subchain.base);

        let capacity = span
            .iter()
            .map(|v| v.metadata.capacity_bytes())
            .max()
            .unwrap_or_default();
        let enlarged = capacity > base.capacity_bytes();

        if self.manifest.is_block() {
            self.extend_base(subchain, &base, capacity).await?;
        }
        if enlarged {
            self.update_base_capacity(subchain, &mut base, capacity)
                .await?;
        }

        locks.release();
        tracing::info!("Prepared merge");
        Ok(())
    }

    /// Reconnect the chain around the merged span and restore base to LEGAL.
    ///
    /// Safe to retry after a failure: a live child that already points at
    /// base is not rebased again.
    #[instrument(skip_all, fields(subchain = %subchain))]
    pub async fn finalize(&self, subchain: &SubchainInfo) -> Result<()> {
        let locks = self.lock(subchain).await?;

        let mut base = self
            .manifest
            .read_metadata(&subchain.image, &subchain.base)
            .await?;
        if base.legality() != Legality::Illegal {
            return Err(Error::UnexpectedVolumeState {
                volume: subchain.base,
                expected: Legality::Illegal,
                actual: base.legality(),
            });
        }

        let chain = self.manifest.image_chain(&subchain.image).await?;
        let span: HashSet<VolumeId> = subchain.validate(&chain)?.iter().map(|v| v.id).collect();
        let (lineage, live_path) = live_lineage(&chain, subchain);

        match lineage {
            Lineage::ThroughTop(child) => self.rebase_child(subchain, child).await?,
            Lineage::Rebased(child) => {
                tracing::info!("Child volume {} already rebased onto base", child.id);
            }
            Lineage::TopIsLeaf => {
                tracing::info!("Top volume {} was the leaf, base becomes leaf", subchain.top);
                base.voltype = VolumeType::Leaf;
            }
        }

        let remaining = remaining_chain(&live_path, &span, subchain.base);
        self.tracker
            .chain_updated(&subchain.domain, &subchain.image, &remaining)
            .await?;

        base.apply(&LegalityTransition::commit_merge());
        self.manifest
            .write_metadata(&subchain.image, &subchain.base, &base)
            .await?;

        locks.release();
        tracing::info!(
            generation = base.generation(),
            "Finalized merge, base volume {} is LEGAL",
            subchain.base
        );
        Ok(())
    }

    fn check_domain(&self, subchain: &SubchainInfo) -> Result<()> {
        if subchain.domain == self.manifest.domain_id() {
            Ok(())
        } else {
            Err(Error::UnknownDomain(subchain.domain))
        }
    }

    async fn lock(&self, subchain: &SubchainInfo) -> Result<HeldLocks> {
        self.check_domain(subchain)?;
        let plan = LockPlan::for_merge(&subchain.domain, &subchain.image, &subchain.base)?;
        acquire_all(self.resources.as_ref(), &plan).await
    }

    async fn extend_base(
        &self,
        subchain: &SubchainInfo,
        base: &VolumeMetadata,
        capacity: u64,
    ) -> Result<()> {
        let required = max_allocation(base.format, capacity, self.extent_size);
        let current = self
            .manifest
            .allocation(&subchain.image, &subchain.base)
            .await?;
        if required > current {
            tracing::info!(current, required, "Extending base volume {}", subchain.base);
            self.manifest
                .extend(&subchain.image, &subchain.base, required)
                .await?;
        }
        Ok(())
    }

    async fn update_base_capacity(
        &self,
        subchain: &SubchainInfo,
        base: &mut VolumeMetadata,
        capacity: u64,
    ) -> Result<()> {
        tracing::info!(
            from = base.capacity_bytes(),
            to = capacity,
            "Enlarging base volume {}",
            subchain.base
        );
        self.manifest
            .resize_image(&subchain.image, &subchain.base, capacity)
            .await?;
        base.set_capacity_bytes(capacity);
        self.manifest
            .write_metadata(&subchain.image, &subchain.base, base)
            .await
    }

    async fn rebase_child(&self, subchain: &SubchainInfo, child: &Volume) -> Result<()> {
        tracing::info!("Rebasing child volume {} onto {}", child.id, subchain.base);
        self.manifest
            .rebase(&subchain.image, &child.id, &subchain.base)
            .await?;
        let mut metadata = self
            .manifest
            .read_metadata(&subchain.image, &child.id)
            .await?;
        metadata.parent = Some(subchain.base);
        self.manifest
            .write_metadata(&subchain.image, &child.id, &metadata)
            .await
    }
}

/// Where the image's live leaf sits relative to the merged span.
#[derive(Debug, Clone, Copy)]
enum Lineage<'a> {
    /// Top is the leaf; base takes its place.
    TopIsLeaf,
    /// The leaf descends from top through this child, which needs a rebase.
    ThroughTop(&'a Volume),
    /// The leaf reaches base without passing top: an earlier finalize already
    /// rebased this child.
    Rebased(&'a Volume),
}

/// Find the live leaf-to-root path of the image and how it meets the span.
///
/// Volumes merged away by earlier finalizes stay on storage with their old
/// parent links, so a parent link alone does not make a volume live. The
/// live leaf is top when top is a LEAF, otherwise the newest LEAF whose
/// ancestry reaches base. A LEAF merged away earlier is always older than
/// any volume created on top of its base afterwards.
fn live_lineage<'a>(chain: &'a [Volume], subchain: &SubchainInfo) -> (Lineage<'a>, Vec<&'a Volume>) {
    let by_id: HashMap<VolumeId, &'a Volume> = chain.iter().map(|v| (v.id, v)).collect();
    let top_path = ancestry(&by_id, subchain.top);
    if top_path
        .first()
        .is_some_and(|top| top.metadata.voltype == VolumeType::Leaf)
    {
        return (Lineage::TopIsLeaf, top_path);
    }

    let leaf_path = chain
        .iter()
        .filter(|v| v.metadata.voltype == VolumeType::Leaf && v.id != subchain.base)
        .map(|leaf| ancestry(&by_id, leaf.id))
        .filter(|path| path.iter().any(|v| v.id == subchain.base))
        .max_by_key(|path| path.first().map(|leaf| leaf.metadata.ctime));

    let Some(path) = leaf_path else {
        // No LEAF reaches base; trust top's direct child if there is one.
        return match chain.iter().find(|v| v.parent() == Some(&subchain.top)) {
            Some(child) => {
                let mut path = vec![child];
                path.extend(top_path);
                (Lineage::ThroughTop(child), path)
            }
            None => (Lineage::TopIsLeaf, top_path),
        };
    };

    if let Some(child) = child_on_path(&path, subchain.top) {
        (Lineage::ThroughTop(child), path)
    } else if let Some(child) = child_on_path(&path, subchain.base) {
        (Lineage::Rebased(child), path)
    } else {
        (Lineage::TopIsLeaf, top_path)
    }
}

/// Volumes from `from` up to the root, stopping at a missing parent or a
/// cycle.
fn ancestry<'a>(by_id: &HashMap<VolumeId, &'a Volume>, from: VolumeId) -> Vec<&'a Volume> {
    let mut path = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(from);
    while let Some(id) = next {
        let Some(volume) = by_id.get(&id).copied() else {
            break;
        };
        if !seen.insert(id) {
            break;
        }
        path.push(volume);
        next = volume.parent().copied();
    }
    path
}

/// The volume directly below `id` on a leaf-to-root path.
fn child_on_path<'a>(path: &[&'a Volume], id: VolumeId) -> Option<&'a Volume> {
    let at = path.iter().position(|v| v.id == id)?;
    at.checked_sub(1).map(|below| path[below])
}

/// Chain ids after the merge, root first: the live path minus the span above
/// base.
fn remaining_chain(live_path: &[&Volume], span: &HashSet<VolumeId>, base: VolumeId) -> Vec<VolumeId> {
    live_path
        .iter()
        .rev()
        .map(|v| v.id)
        .filter(|id| *id == base || !span.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{DomainId, ImageId};

    const GIB: u64 = 1024 * MIB;

    #[test]
    fn test_raw_allocation_equals_capacity() {
        assert_eq!(
            max_allocation(VolumeFormat::Raw, GIB, DEFAULT_EXTENT_SIZE),
            GIB
        );
    }

    #[test]
    fn test_allocation_rounds_up_to_extent() {
        assert_eq!(
            max_allocation(VolumeFormat::Raw, GIB + 1, DEFAULT_EXTENT_SIZE),
            GIB + DEFAULT_EXTENT_SIZE
        );
    }

    #[test]
    fn test_cow_allocation_adds_overhead() {
        let size = max_allocation(VolumeFormat::Cow, GIB, DEFAULT_EXTENT_SIZE);
        assert!(size > GIB);
        assert_eq!(size % DEFAULT_EXTENT_SIZE, 0);
    }

    #[test]
    fn test_transitions() {
        let mut md = VolumeMetadata::new(DomainId::new(), ImageId::new(), 8, VolumeFormat::Raw);
        md.apply(&LegalityTransition::begin_merge());
        assert_eq!(md.legality(), Legality::Illegal);
        assert_eq!(md.generation(), 0);

        md.apply(&LegalityTransition::commit_merge());
        assert_eq!(md.legality(), Legality::Legal);
        assert_eq!(md.generation(), 1);
    }

    fn linear(domain: DomainId, image: ImageId, len: usize) -> Vec<Volume> {
        let mut chain: Vec<Volume> = Vec::new();
        for index in 0..len {
            let mut md = VolumeMetadata::new(domain, image, 8, VolumeFormat::Cow)
                .with_ctime(1_700_000_000 + i64::try_from(index).unwrap_or_default());
            md.parent = chain.last().map(|v| v.id);
            if index + 1 < len {
                md.voltype = VolumeType::Internal;
            }
            chain.push(Volume::new(VolumeId::new(), md));
        }
        chain
    }

    fn request(chain: &[Volume], base: usize, top: usize) -> SubchainInfo {
        let md = &chain[0].metadata;
        let host = crate::ids::HostId::new(1).unwrap();
        SubchainInfo::new(md.domain, md.image, chain[base].id, chain[top].id, 0, host)
    }

    #[test]
    fn test_remaining_chain_skips_merged_span() {
        let chain = linear(DomainId::new(), ImageId::new(), 4);
        let ids: Vec<VolumeId> = chain.iter().map(|v| v.id).collect();
        let span: HashSet<VolumeId> = ids[1..3].iter().copied().collect();
        let live_path: Vec<&Volume> = chain.iter().rev().collect();

        let remaining = remaining_chain(&live_path, &span, ids[1]);
        assert_eq!(remaining, vec![ids[0], ids[1], ids[3]]);
    }

    #[test]
    fn test_lineage_through_top_names_the_child() {
        let chain = linear(DomainId::new(), ImageId::new(), 4);
        let (lineage, path) = live_lineage(&chain, &request(&chain, 0, 2));
        assert!(matches!(lineage, Lineage::ThroughTop(child) if child.id == chain[3].id));
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn test_merged_away_sibling_is_not_a_rebased_child() {
        // A <- B <- C after merging B into A: C points at A, B still on storage.
        let mut chain = linear(DomainId::new(), ImageId::new(), 3);
        chain[2].metadata.parent = Some(chain[0].id);

        let (lineage, path) = live_lineage(&chain, &request(&chain, 0, 2));

        assert!(matches!(lineage, Lineage::TopIsLeaf));
        let ids: Vec<VolumeId> = path.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![chain[2].id, chain[0].id]);
    }

    #[test]
    fn test_newest_leaf_wins_over_stale_leaf() {
        // Stale leaf X merged away under A earlier, live leaf D created later.
        let mut chain = linear(DomainId::new(), ImageId::new(), 3);
        chain[2].metadata.parent = Some(chain[0].id);
        let mut stale = chain[2].metadata.clone().with_ctime(1_600_000_000);
        stale.parent = Some(chain[0].id);
        chain.push(Volume::new(VolumeId::new(), stale));

        let (lineage, _) = live_lineage(&chain, &request(&chain, 0, 1));

        assert!(matches!(lineage, Lineage::Rebased(child) if child.id == chain[2].id));
    }
}
