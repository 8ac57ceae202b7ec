//! Daemon configuration.
//!
//! Layered, later layers win:
//! 1. built-in defaults
//! 2. global file (`$XDG_CONFIG_HOME/spmd/config.toml`)
//! 3. explicit file passed by the caller
//! 4. `SPMD_*` environment variables
//!
//! The merged result is validated before it is returned.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{volume::BLOCK_SIZE, Error, Result};

const MIB: u64 = 1024 * 1024;

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub lock: LockConfig,
    pub storage: StorageConfig,
    pub commit: CommitConfig,
}

/// Which cluster lock implementation a host runs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LockKind {
    #[default]
    LeaseDaemon,
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub kind: LockKind,
    pub renewal_interval_secs: u64,
    pub lease_time_secs: u64,
    pub fail_retries: u32,
    pub io_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Resource name of the SPM lease.
    pub spm_lease_name: String,
    /// Byte offset of the SPM lease inside the leases volume.
    pub spm_lease_offset: u64,
    pub legacy_helper: PathBuf,
    pub legacy_free_helper: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub resource_timeout_secs: u64,
    pub block_extent_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommitConfig {
    pub qemu_img: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            kind: LockKind::default(),
            renewal_interval_secs: 5,
            lease_time_secs: 60,
            fail_retries: 3,
            io_timeout_secs: 10,
            max_reconnect_attempts: 3,
            spm_lease_name: "SDM".to_string(),
            spm_lease_offset: MIB,
            legacy_helper: PathBuf::from("/usr/libexec/spmd/spmprotect.sh"),
            legacy_free_helper: PathBuf::from("/usr/libexec/spmd/spmstop.sh"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resource_timeout_secs: 120,
            block_extent_mb: 128,
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            qemu_img: PathBuf::from("qemu-img"),
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    #[must_use]
    pub const fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    #[must_use]
    pub const fn lease_time(&self) -> Duration {
        Duration::from_secs(self.lease_time_secs)
    }
}

impl StorageConfig {
    #[must_use]
    pub const fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    #[must_use]
    pub const fn extent_size(&self) -> u64 {
        self.block_extent_mb.saturating_mul(MIB)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════

/// Load the layered configuration.
///
/// # Errors
///
/// Returns error if:
/// - a config file is malformed TOML
/// - `explicit` is given but cannot be read
/// - an environment override cannot be parsed
/// - the merged values fail validation
pub async fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if tokio::fs::try_exists(&global_path).await.unwrap_or(false) {
            config.merge(load_toml_file(&global_path).await?);
        }
    }

    if let Some(path) = explicit {
        config.merge(load_toml_file(path).await?);
    }

    config.apply_env_vars()?;
    config.validate()?;
    Ok(config)
}

fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "spmd")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

async fn load_toml_file(path: &Path) -> Result<ConfigLayer> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::io(format!("Failed to read config file {}", path.display()), e))?;
    toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config: {}: {e}", path.display()))
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// MERGE
// ═══════════════════════════════════════════════════════════════════════════

/// One config file as written: `None` for every key the file leaves out.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigLayer {
    pub lock: LockLayer,
    pub storage: StorageLayer,
    pub commit: CommitLayer,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockLayer {
    pub kind: Option<LockKind>,
    pub renewal_interval_secs: Option<u64>,
    pub lease_time_secs: Option<u64>,
    pub fail_retries: Option<u32>,
    pub io_timeout_secs: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub spm_lease_name: Option<String>,
    pub spm_lease_offset: Option<u64>,
    pub legacy_helper: Option<PathBuf>,
    pub legacy_free_helper: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageLayer {
    pub resource_timeout_secs: Option<u64>,
    pub block_extent_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommitLayer {
    pub qemu_img: Option<PathBuf>,
}

/// Overwrite every field the layer sets, including back to a default.
macro_rules! take_set {
    ($self:ident, $layer:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $layer.$field {
                $self.$field = value;
            }
        )+
    };
}

impl LockConfig {
    fn merge(&mut self, layer: LockLayer) {
        take_set!(
            self,
            layer,
            kind,
            renewal_interval_secs,
            lease_time_secs,
            fail_retries,
            io_timeout_secs,
            max_reconnect_attempts,
            spm_lease_name,
            spm_lease_offset,
            legacy_helper,
            legacy_free_helper,
        );
    }
}

impl StorageConfig {
    fn merge(&mut self, layer: StorageLayer) {
        take_set!(self, layer, resource_timeout_secs, block_extent_mb);
    }
}

impl CommitConfig {
    fn merge(&mut self, layer: CommitLayer) {
        take_set!(self, layer, qemu_img);
    }
}

impl Config {
    /// Merge a file layer into this config (the layer takes precedence).
    pub fn merge(&mut self, layer: ConfigLayer) {
        self.lock.merge(layer.lock);
        self.storage.merge(layer.storage);
        self.commit.merge(layer.commit);
    }

    /// Apply `SPMD_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns error if an environment value cannot be parsed
    pub fn apply_env_vars(&mut self) -> Result<()> {
        if let Some(value) = env_value("SPMD_LOCK_KIND")? {
            self.lock.kind = value;
        }
        if let Some(value) = env_value("SPMD_LOCK_IO_TIMEOUT_SECS")? {
            self.lock.io_timeout_secs = value;
        }
        if let Some(value) = env_value("SPMD_LOCK_MAX_RECONNECT_ATTEMPTS")? {
            self.lock.max_reconnect_attempts = value;
        }
        if let Some(value) = env_value("SPMD_STORAGE_RESOURCE_TIMEOUT_SECS")? {
            self.storage.resource_timeout_secs = value;
        }
        if let Ok(value) = std::env::var("SPMD_QEMU_IMG") {
            self.commit.qemu_img = PathBuf::from(value);
        }
        Ok(())
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range
    pub fn validate(&self) -> Result<()> {
        let lock = &self.lock;
        if lock.renewal_interval_secs >= lock.lease_time_secs {
            return Err(Error::InvalidConfig(format!(
                "lock.renewal_interval_secs ({}) must be less than lock.lease_time_secs ({})",
                lock.renewal_interval_secs, lock.lease_time_secs
            )));
        }
        if lock.io_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "lock.io_timeout_secs must be at least 1".to_string(),
            ));
        }
        if lock.max_reconnect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "lock.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if lock.spm_lease_offset % BLOCK_SIZE != 0 {
            return Err(Error::InvalidConfig(format!(
                "lock.spm_lease_offset ({}) must be a multiple of {BLOCK_SIZE}",
                lock.spm_lease_offset
            )));
        }
        if lock.spm_lease_name.is_empty() {
            return Err(Error::InvalidConfig(
                "lock.spm_lease_name must not be empty".to_string(),
            ));
        }
        if self.storage.block_extent_mb == 0 {
            return Err(Error::InvalidConfig(
                "storage.block_extent_mb must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .ok()
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("Invalid {name} value '{value}': {e}")))
        })
        .transpose()
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
