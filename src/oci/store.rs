//! Image-layout backed content store adapter.
//!
//! Reads the OCI image layout the runtime maintains on disk:
//!
//! ```text
//! <root>/
//! ├── index.json            # top-level descriptors, tag refs in annotations
//! └── blobs/sha256/<hex>    # manifests, configs and layers
//! ```
//!
//! Everything is read-only; garbage collection and leasing stay with the
//! runtime.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::oci::{
    manifest_media_type, media_types, BlobStream, Digest, Image, ImageIndex, ImageManifest,
    ImageReference, OciClient,
};

/// Filesystem [`OciClient`] over an OCI image layout directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    async fn read_index(&self) -> Result<ImageIndex> {
        let path = self.root.join("index.json");
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::not_found(format!("image index not found at {}", path.display())))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        tokio::fs::read(&path)
            .await
            .map_err(|_| Error::not_found(format!("content not found for digest {digest}")))
    }

    fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Expand one top-level descriptor into an [`Image`].
    ///
    /// Only digests whose content is actually on disk are included, the
    /// advertised set must never name content this node cannot serve.
    async fn expand_image(&self, reference: ImageReference, digest: Digest) -> Result<Image> {
        let mut image = Image {
            reference,
            digest: digest.clone(),
            manifest_digests: Vec::new(),
            config_digest: None,
            layer_digests: Vec::new(),
        };

        let top = self.read_blob(&digest).await?;
        let media_type = manifest_media_type(&top)?;
        if media_types::is_index(&media_type) {
            let index: ImageIndex = serde_json::from_slice(&top)?;
            for descriptor in &index.manifests {
                image.manifest_digests.push(descriptor.digest.clone());
                if !self.has_blob(&descriptor.digest) {
                    continue;
                }
                let manifest_bytes = self.read_blob(&descriptor.digest).await?;
                let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
                self.collect_manifest_digests(&manifest, &mut image);
            }
        } else {
            let manifest: ImageManifest = serde_json::from_slice(&top)?;
            self.collect_manifest_digests(&manifest, &mut image);
        }
        Ok(image)
    }

    fn collect_manifest_digests(&self, manifest: &ImageManifest, image: &mut Image) {
        if self.has_blob(&manifest.config.digest) {
            image.config_digest = Some(manifest.config.digest.clone());
        }
        for layer in &manifest.layers {
            if self.has_blob(&layer.digest) {
                image.layer_digests.push(layer.digest.clone());
            }
        }
    }
}

#[async_trait]
impl OciClient for FsStore {
    async fn list_images(&self) -> Result<Vec<Image>> {
        let index = self.read_index().await?;
        let mut images = Vec::new();
        for descriptor in &index.manifests {
            let Some(ref_name) = descriptor.ref_name() else {
                continue;
            };
            let reference = match ImageReference::parse(ref_name) {
                Ok(reference) => reference,
                Err(err) => {
                    tracing::warn!(reference = ref_name, error = %err, "skipping unparsable image reference");
                    continue;
                }
            };
            if !self.has_blob(&descriptor.digest) {
                continue;
            }
            match self.expand_image(reference, descriptor.digest.clone()).await {
                Ok(image) => images.push(image),
                Err(err) => {
                    tracing::warn!(reference = ref_name, error = %err, "skipping image with unreadable content");
                }
            }
        }
        Ok(images)
    }

    async fn resolve(&self, reference: &str) -> Result<Digest> {
        let wanted = ImageReference::parse(reference)?;
        let index = self.read_index().await?;
        for descriptor in &index.manifests {
            let Some(ref_name) = descriptor.ref_name() else {
                continue;
            };
            if ImageReference::parse(ref_name).is_ok_and(|stored| stored == wanted) {
                return Ok(descriptor.digest.clone());
            }
        }
        Err(Error::not_found(format!(
            "reference not present in store: {reference}"
        )))
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<(Bytes, String)> {
        let bytes = self.read_blob(digest).await?;
        let media_type = manifest_media_type(&bytes)?;
        Ok((Bytes::from(bytes), media_type))
    }

    async fn size(&self, digest: &Digest) -> Result<u64> {
        let path = self.blob_path(digest);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::not_found(format!("content not found for digest {digest}")))?;
        Ok(metadata.len())
    }

    async fn get_blob(&self, digest: &Digest) -> Result<BlobStream> {
        let path = self.blob_path(digest);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| Error::not_found(format!("content not found for digest {digest}")))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }
}
