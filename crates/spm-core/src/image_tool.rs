//! Disk image tool boundary.
//!
//! The chain-commit itself and the backing-file rewrites are done by an
//! external image tool. Core logic only observes success or failure.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use tracing::instrument;

use crate::{process, volume::VolumeFormat, Result};

/// Operations on image files performed out of process.
#[async_trait::async_trait]
pub trait ImageTool: Send + Sync {
    /// Commit the contents of `top` and its backing chain down to `base`.
    async fn commit(&self, top: &Path, base: &Path) -> Result<()>;

    /// Rewrite `child`'s backing reference to `backing` without copying data.
    async fn rebase(&self, child: &Path, backing: &Path, backing_format: VolumeFormat)
        -> Result<()>;

    /// Set the virtual size of `path` to `size` bytes.
    async fn resize(&self, path: &Path, format: VolumeFormat, size: u64) -> Result<()>;
}

/// `qemu-img` driver.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl QemuImg {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

const fn qemu_format(format: VolumeFormat) -> &'static str {
    match format {
        VolumeFormat::Raw => "raw",
        VolumeFormat::Cow => "qcow2",
    }
}

fn args<const N: usize>(words: [&str; N], paths: &[&Path]) -> Vec<OsString> {
    words
        .iter()
        .map(OsString::from)
        .chain(paths.iter().map(|p| p.as_os_str().to_os_string()))
        .collect()
}

fn commit_args(top: &Path, base: &Path) -> Vec<OsString> {
    args(["commit", "-p", "-t", "none", "-b"], &[base, top])
}

fn rebase_args(child: &Path, backing: &Path, backing_format: VolumeFormat) -> Vec<OsString> {
    args(
        [
            "rebase",
            "-u",
            "-t",
            "none",
            "-f",
            "qcow2",
            "-F",
            qemu_format(backing_format),
            "-b",
        ],
        &[backing, child],
    )
}

fn resize_args(path: &Path, format: VolumeFormat, size: u64) -> Vec<OsString> {
    let mut argv = args(["resize", "-f", qemu_format(format)], &[path]);
    argv.push(size.to_string().into());
    argv
}

#[async_trait::async_trait]
impl ImageTool for QemuImg {
    #[instrument(skip(self))]
    async fn commit(&self, top: &Path, base: &Path) -> Result<()> {
        process::run(&self.binary, commit_args(top, base), None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rebase(
        &self,
        child: &Path,
        backing: &Path,
        backing_format: VolumeFormat,
    ) -> Result<()> {
        process::run(&self.binary, rebase_args(child, backing, backing_format), None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resize(&self, path: &Path, format: VolumeFormat, size: u64) -> Result<()> {
        process::run(&self.binary, resize_args(path, format, size), None).await?;
        Ok(())
    }
}
