//! Read-only view over the local OCI content store.
//!
//! The registry depends on the narrow [`OciClient`] interface; the default
//! implementation is the image-layout backed [`FsStore`]. Nothing here
//! writes content, the runtime owns the store lifecycle.

mod reference;
mod store;

pub use reference::ImageReference;
pub use store::FsStore;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// OCI media types used for manifest dispatch.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// True for media types describing a multi-platform index.
    pub fn is_index(media_type: &str) -> bool {
        media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
    }
}

/// Annotation key carrying the tag reference in an image layout index.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// An algorithm-prefixed content digest, e.g. `sha256:<64 hex>`.
///
/// Treated as opaque once validated; only `sha256` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let Some((algorithm, hex_part)) = s.split_once(':') else {
            return Err(Error::InvalidDigest(s));
        };
        if algorithm != "sha256"
            || hex_part.len() != 64
            || !hex_part.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::InvalidDigest(s));
        }
        Ok(Digest(s))
    }

    /// The full `<algorithm>:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The algorithm prefix.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// The hex-encoded hash portion.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or_default()
    }

    /// The decoded hash bytes.
    pub fn decoded(&self) -> Result<Vec<u8>> {
        Ok(hex::decode(self.hex())?)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Digest::parse(s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub annotations: std::collections::HashMap<String, String>,
}

impl Descriptor {
    /// The tag reference recorded on this descriptor, if any.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations.get(REF_NAME_ANNOTATION).map(String::as_str)
    }
}

/// OCI image manifest (single platform).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// OCI image index (multi-platform manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// A locally present image with the digests it pins.
#[derive(Debug, Clone)]
pub struct Image {
    /// Canonical reference the image is stored under
    pub reference: ImageReference,
    /// Top-level manifest or index digest
    pub digest: Digest,
    /// Digests of every manifest listed by an index
    pub manifest_digests: Vec<Digest>,
    /// Digest of the image config, when the manifest is present locally
    pub config_digest: Option<Digest>,
    /// Digests of every layer of locally present manifests
    pub layer_digests: Vec<Digest>,
}

impl Image {
    /// The set of keys this image contributes to the advertised set.
    ///
    /// Tag references whose tag is `latest` are withheld when
    /// `resolve_latest_tag` is off, matching the serving policy so peers are
    /// never pointed at a node that will refuse the request. Digests always
    /// publish.
    pub fn advertised_keys(&self, resolve_latest_tag: bool) -> Vec<String> {
        let mut keys = Vec::new();
        if self.reference.tag.is_some() && (resolve_latest_tag || !self.reference.is_latest_tag()) {
            keys.push(self.reference.to_string());
        }
        keys.push(self.digest.to_string());
        keys.extend(self.manifest_digests.iter().map(Digest::to_string));
        if let Some(config) = &self.config_digest {
            keys.push(config.to_string());
        }
        keys.extend(self.layer_digests.iter().map(Digest::to_string));
        let mut seen = std::collections::HashSet::new();
        keys.retain(|key| seen.insert(key.clone()));
        keys
    }
}

/// Change feed item emitted when the local store gains or loses an image.
#[derive(Debug, Clone)]
pub enum ImageEvent {
    Added(Image),
    Removed(String),
}

/// Streamed blob contents.
pub type BlobStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Narrow, read-only interface over the local content store.
#[async_trait]
pub trait OciClient: Send + Sync {
    /// Enumerate locally present images and the digests they pin.
    async fn list_images(&self) -> Result<Vec<Image>>;

    /// Resolve a floating reference to its manifest digest.
    async fn resolve(&self, reference: &str) -> Result<Digest>;

    /// Read manifest bytes and the media type declared inside them.
    async fn get_manifest(&self, digest: &Digest) -> Result<(Bytes, String)>;

    /// Size in bytes of a stored blob.
    async fn size(&self, digest: &Digest) -> Result<u64>;

    /// Open a stored blob for streaming.
    async fn get_blob(&self, digest: &Digest) -> Result<BlobStream>;
}

/// Extract the `mediaType` field from manifest JSON.
///
/// Manifests without a non-empty media type cannot be served, the runtime
/// needs the Content-Type to dispatch on.
pub fn manifest_media_type(manifest: &[u8]) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(manifest)?;
    match value.get("mediaType").and_then(serde_json::Value::as_str) {
        Some(media_type) if !media_type.is_empty() => Ok(media_type.to_owned()),
        _ => Err(Error::not_found("manifest does not declare a media type")),
    }
}
