//! # spm-core
//!
//! Storage consistency core of the host virtualization daemon.
//!
//! - [`clusterlock`]: elects the single Storage Pool Manager (SPM) host of a
//!   storage domain, using the shared storage as the arbitration channel.
//! - [`volume`]: the volume metadata model and its on-disk codec.
//! - [`merge`]: validates, prepares and finalizes the collapse of a
//!   `base..top` copy-on-write span into base.
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()`, `expect()` or `panic!()` outside tests
//! - No `unsafe`
//! - Legality of a volume changes only through the merge coordinator

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod clusterlock;
pub mod config;
mod error;
pub mod file_domain;
pub mod ids;
pub mod image_tool;
pub mod job;
pub mod manifest;
pub mod merge;
pub mod process;
pub mod resource;
pub mod spm;
pub mod volume;

pub use clusterlock::{ClusterLock, DaemonLease, DomainLeasePaths, LegacyLease};
pub use config::{load_config, Config, LockKind};
pub use error::{Error, ErrorCategory, Result};
pub use ids::{DomainId, HostId, ImageId, VolumeId};
pub use merge::{MergeCoordinator, SubchainInfo};
pub use spm::{SpmRole, SpmStatus};
pub use volume::{Legality, Volume, VolumeMetadata};
