//! Semantic newtypes for storage identifiers.
//!
//! Domains, images and volumes are identified by UUIDs on shared storage.
//! Each newtype parses once at the boundary and cannot hold an invalid value.
//! The all-zero UUID is the on-disk "no parent" sentinel; in memory a root
//! volume has `parent: None` instead.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// On-disk spelling of "no parent".
pub const BLANK_UUID: &str = "00000000-0000-0000-0000-000000000000";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse and validate an identifier.
            pub fn parse(value: &str) -> Result<Self> {
                Uuid::parse_str(value.trim())
                    .map(Self)
                    .map_err(|_| Error::InvalidId {
                        kind: $kind,
                        value: value.to_string(),
                    })
            }

            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }
    };
}

uuid_id!(
    /// Storage domain identifier. Also names the domain's lockspace.
    DomainId,
    "domain id"
);
uuid_id!(
    /// Image (disk) identifier; an image owns one volume chain.
    ImageId,
    "image id"
);
uuid_id!(
    /// Volume identifier.
    VolumeId,
    "volume id"
);

/// Highest host id accepted by the lease subsystem.
pub const MAX_HOST_ID: u16 = 2000;

/// Host identity inside a domain lockspace, `1..=2000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct HostId(u16);

impl HostId {
    pub fn new(value: u16) -> Result<Self> {
        if (1..=MAX_HOST_ID).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidId {
                kind: "host id",
                value: value.to_string(),
            })
        }
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for HostId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value)
    }
}

impl From<HostId> for u16 {
    fn from(value: HostId) -> Self {
        value.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse an on-disk parent reference, mapping the blank sentinel to `None`.
pub fn parse_parent(value: &str) -> Result<Option<VolumeId>> {
    let value = value.trim();
    if value.is_empty() || value == BLANK_UUID {
        Ok(None)
    } else {
        VolumeId::parse(value).map(Some)
    }
}

/// Format a parent reference for disk, using the blank sentinel for roots.
#[must_use]
pub fn format_parent(parent: Option<&VolumeId>) -> String {
    parent.map_or_else(|| BLANK_UUID.to_string(), ToString::to_string)
}
