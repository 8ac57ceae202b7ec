//! Directory-backed storage domain.
//!
//! Layout: `<root>/<domain>/images/<image>/<volume>` holds the volume data
//! and `<volume>.meta` its metadata block. Metadata writes are all or
//! nothing: the block is serialized first (an overflow writes nothing) and
//! then renamed into place.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::instrument;

use crate::{
    ids::{DomainId, ImageId, VolumeId},
    image_tool::ImageTool,
    manifest::{sort_chain, DomainManifest},
    volume::{Volume, VolumeMetadata},
    Error, Result,
};

const META_EXT: &str = "meta";

pub struct FileDomain {
    domain: DomainId,
    dir: PathBuf,
    version: u32,
    block: bool,
    image_tool: Arc<dyn ImageTool>,
}

impl std::fmt::Debug for FileDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDomain")
            .field("domain", &self.domain)
            .field("dir", &self.dir)
            .field("version", &self.version)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

impl FileDomain {
    #[must_use]
    pub fn new(
        root: &Path,
        domain: DomainId,
        version: u32,
        image_tool: Arc<dyn ImageTool>,
    ) -> Self {
        Self {
            domain,
            dir: root.join(domain.to_string()),
            version,
            block: false,
            image_tool,
        }
    }

    /// Treat volumes like block devices: the commit cannot grow them, so
    /// merges extend the base up front.
    #[must_use]
    pub const fn with_block_semantics(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    fn image_dir(&self, image: &ImageId) -> PathBuf {
        self.dir.join("images").join(image.to_string())
    }

    fn meta_path(&self, image: &ImageId, volume: &VolumeId) -> PathBuf {
        self.volume_path(image, volume).with_extension(META_EXT)
    }

    /// Provision a new volume: data file of `allocation` bytes plus metadata.
    #[instrument(skip(self, metadata))]
    pub async fn create_volume(
        &self,
        volume: &VolumeId,
        metadata: &VolumeMetadata,
        allocation: u64,
    ) -> Result<()> {
        let image = metadata.image;
        let dir = self.image_dir(&image);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(format!("Failed to create {}", dir.display()), e))?;

        let path = self.volume_path(&image, volume);
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::io(format!("Failed to create {}", path.display()), e))?;
        file.set_len(allocation)
            .await
            .map_err(|e| Error::io(format!("Failed to allocate {}", path.display()), e))?;

        self.write_metadata(&image, volume, metadata).await?;
        tracing::info!("Created volume {volume}");
        Ok(())
    }
}

#[async_trait::async_trait]
impl DomainManifest for FileDomain {
    fn domain_id(&self) -> DomainId {
        self.domain
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn is_block(&self) -> bool {
        self.block
    }

    async fn image_chain(&self, image: &ImageId) -> Result<Vec<Volume>> {
        let dir = self.image_dir(image);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("Failed to list {}", dir.display()), e)),
        };

        let mut volumes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(id) = VolumeId::parse(stem) else {
                tracing::debug!("Skipping foreign file {}", path.display());
                continue;
            };
            volumes.push(Volume::new(id, self.read_metadata(image, &id).await?));
        }
        Ok(sort_chain(volumes))
    }

    async fn read_metadata(&self, image: &ImageId, volume: &VolumeId) -> Result<VolumeMetadata> {
        let path = self.meta_path(image, volume);
        let block = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::io(format!("Failed to read {}", path.display()), e))?;
        VolumeMetadata::parse_block(&block)
    }

    async fn write_metadata(
        &self,
        image: &ImageId,
        volume: &VolumeId,
        metadata: &VolumeMetadata,
    ) -> Result<()> {
        let text = metadata.serialize(self.version, &BTreeMap::new())?;
        let path = self.meta_path(image, volume);
        let staged = path.with_extension("meta.new");
        tokio::fs::write(&staged, text.as_bytes())
            .await
            .map_err(|e| Error::io(format!("Failed to write {}", staged.display()), e))?;
        tokio::fs::rename(&staged, &path)
            .await
            .map_err(|e| Error::io(format!("Failed to replace {}", path.display()), e))
    }

    async fn allocation(&self, image: &ImageId, volume: &VolumeId) -> Result<u64> {
        let path = self.volume_path(image, volume);
        tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(|e| Error::io(format!("Failed to stat {}", path.display()), e))
    }

    async fn extend(&self, image: &ImageId, volume: &VolumeId, size: u64) -> Result<()> {
        let path = self.volume_path(image, volume);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::io(format!("Failed to open {}", path.display()), e))?;
        let current = file.metadata().await?.len();
        if size > current {
            file.set_len(size)
                .await
                .map_err(|e| Error::io(format!("Failed to extend {}", path.display()), e))?;
        }
        Ok(())
    }

    async fn resize_image(&self, image: &ImageId, volume: &VolumeId, capacity: u64) -> Result<()> {
        let format = self.read_metadata(image, volume).await?.format;
        self.image_tool
            .resize(&self.volume_path(image, volume), format, capacity)
            .await
    }

    async fn rebase(&self, image: &ImageId, child: &VolumeId, backing: &VolumeId) -> Result<()> {
        let backing_format = self.read_metadata(image, backing).await?.format;
        self.image_tool
            .rebase(
                &self.volume_path(image, child),
                &self.volume_path(image, backing),
                backing_format,
            )
            .await
    }

    fn volume_path(&self, image: &ImageId, volume: &VolumeId) -> PathBuf {
        self.image_dir(image).join(volume.to_string())
    }
}
