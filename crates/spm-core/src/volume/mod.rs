//! # Volumes
//!
//! A volume is one link of an image's copy-on-write chain. Its persistent
//! description lives in a fixed-size metadata block ([`VolumeMetadata`]).
//!
//! The enums here use their on-disk spelling for `Display`/`FromStr`, so the
//! metadata codec can round-trip them without a translation table.

pub mod metadata;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::VolumeId;

pub use metadata::{VolumeMetadata, DEFAULT_GENERATION, DESCRIPTION_SIZE, METADATA_SIZE};

/// Sector size used for the legacy `SIZE` key.
pub const BLOCK_SIZE: u64 = 512;

/// Disk image format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum VolumeFormat {
    #[strum(serialize = "RAW")]
    Raw,
    #[strum(serialize = "COW")]
    Cow,
}

/// Allocation policy of the underlying storage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Allocation {
    #[strum(serialize = "PREALLOCATED")]
    Preallocated,
    #[strum(serialize = "SPARSE")]
    Sparse,
}

/// Role of a volume in its chain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum VolumeType {
    /// Writable top of a chain.
    #[strum(serialize = "LEAF")]
    Leaf,
    /// Read-only interior link.
    #[strum(serialize = "INTERNAL")]
    Internal,
    /// Template volume referenced by several images. Never a merge target.
    #[strum(serialize = "SHARED")]
    Shared,
}

/// Whether a volume's contents can be trusted.
///
/// ILLEGAL marks a merge in progress. There is no public setter: the only
/// way to change it is a [`crate::merge::LegalityTransition`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Legality {
    #[strum(serialize = "LEGAL")]
    Legal,
    #[strum(serialize = "ILLEGAL")]
    Illegal,
}

/// A volume as listed in a live chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: VolumeId,
    pub metadata: VolumeMetadata,
}

impl Volume {
    #[must_use]
    pub const fn new(id: VolumeId, metadata: VolumeMetadata) -> Self {
        Self { id, metadata }
    }

    #[must_use]
    pub const fn parent(&self) -> Option<&VolumeId> {
        self.metadata.parent.as_ref()
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.metadata.voltype == VolumeType::Shared
    }
}
