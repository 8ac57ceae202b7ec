//! Volume metadata codec.
//!
//! A volume's metadata is a small text region: sorted `KEY=value` lines
//! followed by a literal `EOF` line, bounded to [`METADATA_SIZE`] bytes.
//!
//! # Compatibility
//!
//! - Blank and malformed lines are skipped when parsing.
//! - Volumes written before generation tracking have no `GEN` key and parse
//!   with [`DEFAULT_GENERATION`].
//! - Domain versions before 5 store the size in 512-byte blocks (`SIZE`) and
//!   carry an always-zero `MTIME` and an empty `POOL_UUID`. Version 5 and
//!   later store the capacity in bytes (`CAP`). Parsing accepts either.
//! - Old writers exceeded the documented description limit, so an overlong
//!   description is truncated with a warning instead of failing.

use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, TimeZone, Utc};

use super::{Allocation, Legality, VolumeFormat, VolumeType, BLOCK_SIZE};
use crate::{
    ids::{format_parent, parse_parent, DomainId, ImageId, VolumeId},
    merge::LegalityTransition,
    Error, Result,
};

/// Fixed metadata block size in bytes.
pub const METADATA_SIZE: usize = 512;

/// Documented description limit in bytes.
pub const DESCRIPTION_SIZE: usize = 210;

/// Generation of volumes written before generation tracking existed.
pub const DEFAULT_GENERATION: u64 = 0;

/// First domain version that stores capacity in bytes.
pub const CAPACITY_IN_BYTES_VERSION: u32 = 5;

/// Terminator line of a metadata block.
pub const TERMINATOR: &str = "EOF";

/// Reported when neither size key is present; either one satisfies a parse.
const SIZE_KEYS: &str = "CAP or SIZE";

pub mod keys {
    pub const DOMAIN: &str = "DOMAIN";
    pub const IMAGE: &str = "IMAGE";
    pub const PARENT: &str = "PUUID";
    pub const SIZE: &str = "SIZE";
    pub const CAPACITY: &str = "CAP";
    pub const FORMAT: &str = "FORMAT";
    pub const ALLOCATION: &str = "TYPE";
    pub const VOLTYPE: &str = "VOLTYPE";
    pub const DISKTYPE: &str = "DISKTYPE";
    pub const DESCRIPTION: &str = "DESCRIPTION";
    pub const LEGALITY: &str = "LEGALITY";
    pub const CTIME: &str = "CTIME";
    pub const GENERATION: &str = "GEN";
    pub const MTIME: &str = "MTIME";
    pub const POOL: &str = "POOL_UUID";
}

/// Typed view of one volume's metadata block.
///
/// Legality and generation are read-only outside of [`VolumeMetadata::apply`],
/// which only accepts a transition minted by the merge coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMetadata {
    pub domain: DomainId,
    pub image: ImageId,
    pub parent: Option<VolumeId>,
    /// Virtual size in 512-byte blocks.
    pub size: u64,
    pub format: VolumeFormat,
    pub allocation: Allocation,
    pub voltype: VolumeType,
    /// Disk usage intent. Opaque to this crate.
    pub disktype: String,
    /// Creation time, seconds since the epoch.
    pub ctime: i64,
    description: String,
    legality: Legality,
    generation: u64,
}

impl VolumeMetadata {
    /// Metadata for a freshly created, legal, root leaf volume.
    #[must_use]
    pub fn new(domain: DomainId, image: ImageId, size: u64, format: VolumeFormat) -> Self {
        let allocation = match format {
            VolumeFormat::Raw => Allocation::Preallocated,
            VolumeFormat::Cow => Allocation::Sparse,
        };
        Self {
            domain,
            image,
            parent: None,
            size,
            format,
            allocation,
            voltype: VolumeType::Leaf,
            disktype: "DATA".to_string(),
            ctime: Utc::now().timestamp(),
            description: String::new(),
            legality: Legality::Legal,
            generation: DEFAULT_GENERATION,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: VolumeId) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn with_voltype(mut self, voltype: VolumeType) -> Self {
        self.voltype = voltype;
        self
    }

    #[must_use]
    pub fn with_allocation(mut self, allocation: Allocation) -> Self {
        self.allocation = allocation;
        self
    }

    #[must_use]
    pub fn with_disktype(mut self, disktype: impl Into<String>) -> Self {
        self.disktype = disktype.into();
        self
    }

    #[must_use]
    pub fn with_ctime(mut self, ctime: i64) -> Self {
        self.ctime = ctime;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.set_description(description);
        self
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = truncate_description(description.into());
    }

    #[must_use]
    pub const fn legality(&self) -> Legality {
        self.legality
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn capacity_bytes(&self) -> u64 {
        self.size.saturating_mul(BLOCK_SIZE)
    }

    /// Record a new virtual size, rounding up to whole blocks.
    pub fn set_capacity_bytes(&mut self, bytes: u64) {
        self.size = bytes.div_ceil(BLOCK_SIZE);
    }

    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.ctime, 0).single()
    }

    /// Apply a legality transition minted by the merge coordinator.
    pub fn apply(&mut self, transition: &LegalityTransition) {
        self.legality = transition.target();
        if transition.bumps_generation() {
            self.generation = self.generation.saturating_add(1);
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // PARSE
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Parse metadata lines up to the terminator.
    pub fn parse<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut md = BTreeMap::new();
        for line in lines {
            let line = line
                .as_ref()
                .trim_end_matches(|c| matches!(c, '\r' | '\n' | '\0'))
                .trim_start_matches('\0');
            if line.trim().is_empty() {
                continue;
            }
            if line.trim_start().starts_with(TERMINATOR) {
                break;
            }
            // Values keep their whitespace; descriptions are stored verbatim.
            match line.split_once('=') {
                Some((key, value)) => {
                    md.insert(key.trim().to_string(), value.to_string());
                }
                None => tracing::debug!("Skipping malformed metadata line: {line:?}"),
            }
        }
        Self::from_fields(&md)
    }

    /// Parse a raw metadata block as read from storage.
    pub fn parse_block(block: &[u8]) -> Result<Self> {
        Self::parse(String::from_utf8_lossy(block).lines())
    }

    fn from_fields(md: &BTreeMap<String, String>) -> Result<Self> {
        let size = match (md.get(keys::CAPACITY), md.get(keys::SIZE)) {
            (Some(cap), _) => parse_number::<u64>(keys::CAPACITY, cap)?.div_ceil(BLOCK_SIZE),
            (None, Some(size)) => parse_number(keys::SIZE, size)?,
            (None, None) => return Err(missing(SIZE_KEYS, md)),
        };

        let generation = md
            .get(keys::GENERATION)
            .map(|value| parse_number(keys::GENERATION, value))
            .transpose()?
            .unwrap_or(DEFAULT_GENERATION);

        let parent_raw = required(md, keys::PARENT)?;
        let parent = parse_parent(parent_raw.trim()).map_err(|_| invalid(keys::PARENT, parent_raw))?;

        Ok(Self {
            domain: parse_value(md, keys::DOMAIN)?,
            image: parse_value(md, keys::IMAGE)?,
            parent,
            size,
            format: parse_value(md, keys::FORMAT)?,
            allocation: parse_value(md, keys::ALLOCATION)?,
            voltype: parse_value(md, keys::VOLTYPE)?,
            disktype: md.get(keys::DISKTYPE).cloned().unwrap_or_default(),
            ctime: parse_number(keys::CTIME, required(md, keys::CTIME)?)?,
            description: truncate_description(required(md, keys::DESCRIPTION)?.to_string()),
            legality: parse_value(md, keys::LEGALITY)?,
            generation,
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // SERIALIZE
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Native fields of this volume for the given domain version.
    pub fn entries(&self, domain_version: u32) -> impl Iterator<Item = (&'static str, String)> {
        let size_entry = if domain_version >= CAPACITY_IN_BYTES_VERSION {
            (keys::CAPACITY, self.capacity_bytes().to_string())
        } else {
            (keys::SIZE, self.size.to_string())
        };
        [
            (keys::DOMAIN, self.domain.to_string()),
            (keys::IMAGE, self.image.to_string()),
            (keys::PARENT, format_parent(self.parent.as_ref())),
            size_entry,
            (keys::FORMAT, self.format.to_string()),
            (keys::ALLOCATION, self.allocation.to_string()),
            (keys::VOLTYPE, self.voltype.to_string()),
            (keys::DISKTYPE, self.disktype.clone()),
            (keys::DESCRIPTION, self.description.clone()),
            (keys::LEGALITY, self.legality.to_string()),
            (keys::CTIME, self.ctime.to_string()),
            (keys::GENERATION, self.generation.to_string()),
        ]
        .into_iter()
    }

    /// Render the metadata block for a domain of the given version.
    ///
    /// `overrides` are merged last and may add keys outside the native set.
    /// Fails with [`Error::MetadataOverflow`] instead of truncating.
    pub fn serialize(
        &self,
        domain_version: u32,
        overrides: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut fields: BTreeMap<String, String> = self
            .entries(domain_version)
            .map(|(key, value)| (key.to_string(), value))
            .collect();

        if domain_version < CAPACITY_IN_BYTES_VERSION {
            fields.insert(keys::MTIME.to_string(), "0".to_string());
            fields.insert(keys::POOL.to_string(), String::new());
        }

        fields.extend(
            overrides
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        if let Some((key, value)) = fields
            .iter()
            .find(|(key, value)| !is_writable_key(key) || !is_writable_value(value))
        {
            return Err(invalid(key, value));
        }

        let mut text: String = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect();
        text.push_str(TERMINATOR);
        text.push('\n');

        if text.len() > METADATA_SIZE {
            return Err(Error::MetadataOverflow {
                size: text.len(),
                limit: METADATA_SIZE,
            });
        }
        Ok(text)
    }
}

fn truncate_description(mut description: String) -> String {
    if description.len() > DESCRIPTION_SIZE {
        tracing::warn!(
            "Description is too long ({} bytes), truncating to {DESCRIPTION_SIZE} bytes",
            description.len()
        );
        let mut cut = DESCRIPTION_SIZE;
        while !description.is_char_boundary(cut) {
            cut -= 1;
        }
        description.truncate(cut);
    }
    description
}

/// A key must survive the line format: non-empty, no separator, no
/// surrounding whitespace, and never mistaken for the terminator.
fn is_writable_key(key: &str) -> bool {
    !key.is_empty()
        && key.trim() == key
        && !key.starts_with(TERMINATOR)
        && !key.contains(|c: char| c == '=' || c.is_control())
}

/// Values are stored verbatim up to the end of the line.
fn is_writable_value(value: &str) -> bool {
    !value.contains(|c| matches!(c, '\n' | '\r' | '\0'))
}

fn missing(key: &'static str, md: &BTreeMap<String, String>) -> Error {
    Error::MetadataKeyMissing {
        key,
        found: md.clone(),
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::InvalidMetadata {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn required<'a>(md: &'a BTreeMap<String, String>, key: &'static str) -> Result<&'a str> {
    md.get(key).map(String::as_str).ok_or_else(|| missing(key, md))
}

fn parse_value<T: FromStr>(md: &BTreeMap<String, String>, key: &'static str) -> Result<T> {
    let raw = required(md, key)?;
    raw.trim().parse().map_err(|_| invalid(key, raw))
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| invalid(key, raw))
}
