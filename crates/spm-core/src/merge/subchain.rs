use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    ids::{DomainId, HostId, ImageId, VolumeId},
    volume::Volume,
    Error, Result,
};

/// A contiguous `base..top` span selected for a merge.
///
/// Built per merge request by the command layer and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubchainInfo {
    pub domain: DomainId,
    pub image: ImageId,
    pub base: VolumeId,
    pub top: VolumeId,
    /// Base generation observed when the request was built.
    pub base_generation: u64,
    pub host_id: HostId,
}

impl SubchainInfo {
    #[must_use]
    pub const fn new(
        domain: DomainId,
        image: ImageId,
        base: VolumeId,
        top: VolumeId,
        base_generation: u64,
        host_id: HostId,
    ) -> Self {
        Self {
            domain,
            image,
            base,
            top,
            base_generation,
            host_id,
        }
    }

    /// Check the span against the image's live chain.
    ///
    /// Returns the span's volumes, base first, top last.
    ///
    /// # Errors
    ///
    /// - `VolumeNotInChain` when base or top is not part of `chain`
    /// - `WrongParentVolume` when top does not descend from base
    /// - `SharedVolumeNonWritable` when any volume of the span is shared
    pub fn validate<'a>(&self, chain: &'a [Volume]) -> Result<Vec<&'a Volume>> {
        let by_id: HashMap<VolumeId, &Volume> = chain.iter().map(|v| (v.id, v)).collect();

        let top = self.lookup(&by_id, self.top)?;
        self.lookup(&by_id, self.base)?;
        if self.base == self.top {
            return Err(self.wrong_parent());
        }

        // Walk from top towards the root; a well-formed chain reaches base in
        // fewer steps than it has volumes.
        let mut span = vec![top];
        let mut current = top;
        loop {
            let parent = current.parent().ok_or_else(|| self.wrong_parent())?;
            let next = by_id.get(parent).copied().ok_or_else(|| self.wrong_parent())?;
            span.push(next);
            if next.id == self.base {
                break;
            }
            if span.len() > chain.len() {
                return Err(self.wrong_parent());
            }
            current = next;
        }
        span.reverse();

        if let Some(shared) = span.iter().find(|v| v.is_shared()) {
            return Err(Error::SharedVolumeNonWritable { volume: shared.id });
        }
        Ok(span)
    }

    fn lookup<'a>(
        &self,
        by_id: &HashMap<VolumeId, &'a Volume>,
        volume: VolumeId,
    ) -> Result<&'a Volume> {
        by_id
            .get(&volume)
            .copied()
            .ok_or_else(|| Error::VolumeNotInChain {
                domain: self.domain,
                image: self.image,
                volume,
            })
    }

    fn wrong_parent(&self) -> Error {
        Error::WrongParentVolume {
            base: self.base,
            top: self.top,
        }
    }
}

impl fmt::Display for SubchainInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Subchain domain={} image={} base={} top={} base_generation={} host={}>",
            self.domain, self.image, self.base, self.top, self.base_generation, self.host_id
        )
    }
}
