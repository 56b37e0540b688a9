//! Image reference parsing and canonical formatting.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::oci::Digest;

/// Parsed OCI image reference.
///
/// Canonical form is `<registry>/<repository>[:<tag>][@<digest>]`. A
/// reference carrying a digest is pinned; a tag-only reference is floating
/// and must be resolved against the content store before serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// Registry host, optionally with port (e.g. "docker.io")
    pub registry: String,
    /// Repository path (e.g. "library/alpine")
    pub repository: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest, if pinned
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Handles formats like:
    /// - `alpine:3.18` -> docker.io/library/alpine:3.18
    /// - `myrepo/myimage:tag` -> docker.io/myrepo/myimage:tag
    /// - `ghcr.io/owner/repo:tag`
    /// - `registry.example.com/foo/bar@sha256:...`
    pub fn parse(image: &str) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(Error::invalid_reference("empty image reference"));
        }

        // Split off a digest reference
        let (image_part, digest) = match image.rfind('@') {
            Some(idx) => {
                let (img, dgst) = image.split_at(idx);
                (img, Some(Digest::parse(&dgst[1..])?))
            }
            None => (image, None),
        };

        // Split off a tag; a colon in the last path component is a tag
        // separator, anywhere earlier it belongs to a host:port
        let (image_part, tag) = match image_part.rfind(':') {
            Some(idx) if !image_part[idx..].contains('/') => {
                let (img, tag) = image_part.split_at(idx);
                (img, Some(tag[1..].to_owned()))
            }
            _ => (image_part, None),
        };

        if tag.is_none() && digest.is_none() {
            return Err(Error::invalid_reference(format!(
                "reference must carry a tag or a digest: {image}"
            )));
        }

        // Split host from repository
        let (registry, repository) = match image_part.find('/') {
            Some(first_slash) => {
                let potential_host = &image_part[..first_slash];
                if potential_host.contains('.')
                    || potential_host.contains(':')
                    || potential_host == "localhost"
                {
                    (
                        potential_host.to_owned(),
                        image_part[first_slash + 1..].to_owned(),
                    )
                } else {
                    ("docker.io".to_owned(), image_part.to_owned())
                }
            }
            None => ("docker.io".to_owned(), format!("library/{image_part}")),
        };

        if repository.is_empty() {
            return Err(Error::invalid_reference(format!(
                "reference has an empty repository: {image}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// True when the reference is pinned to a digest.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// True when the reference tag is literally `latest`.
    pub fn is_latest_tag(&self) -> bool {
        self.tag.as_deref() == Some("latest")
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_simple_image() -> Result<()> {
        let reference = ImageReference::parse("alpine:3.18")?;
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "library/alpine");
        assert_eq!(reference.tag.as_deref(), Some("3.18"));
        assert!(!reference.is_pinned());
        Ok(())
    }

    #[test]
    fn test_parse_user_repo() -> Result<()> {
        let reference = ImageReference::parse("myuser/myimage:v1")?;
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "myuser/myimage");
        assert_eq!(reference.tag.as_deref(), Some("v1"));
        Ok(())
    }

    #[test]
    fn test_parse_custom_registry() -> Result<()> {
        let reference = ImageReference::parse("ghcr.io/owner/repo:tag")?;
        assert_eq!(reference.registry, "ghcr.io");
        assert_eq!(reference.repository, "owner/repo");
        assert_eq!(reference.tag.as_deref(), Some("tag"));
        Ok(())
    }

    #[test]
    fn test_parse_registry_with_port() -> Result<()> {
        let reference = ImageReference::parse("localhost:5000/foo/bar:v2")?;
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "foo/bar");
        assert_eq!(reference.tag.as_deref(), Some("v2"));
        Ok(())
    }

    #[test]
    fn test_parse_digest() -> Result<()> {
        let reference = ImageReference::parse(&format!("alpine@sha256:{HEX}"))?;
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "library/alpine");
        assert_eq!(reference.tag, None);
        assert!(reference.is_pinned());
        Ok(())
    }

    #[test]
    fn test_parse_tag_and_digest() -> Result<()> {
        let reference = ImageReference::parse(&format!("ghcr.io/owner/repo:v1@sha256:{HEX}"))?;
        assert_eq!(reference.tag.as_deref(), Some("v1"));
        assert!(reference.is_pinned());
        Ok(())
    }

    #[test]
    fn test_parse_rejects_untagged() {
        assert!(ImageReference::parse("ghcr.io/owner/repo").is_err());
        assert!(ImageReference::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        assert!(ImageReference::parse("alpine@sha256:notahash").is_err());
    }

    #[test]
    fn test_display_roundtrip() -> Result<()> {
        for s in [
            "docker.io/library/alpine:3.18",
            "ghcr.io/owner/repo:tag",
            &format!("quay.io/app/img@sha256:{HEX}"),
            &format!("quay.io/app/img:v1@sha256:{HEX}"),
        ] {
            let reference = ImageReference::parse(s)?;
            assert_eq!(reference.to_string(), *s);
        }
        Ok(())
    }

    #[test]
    fn test_latest_tag_detection() -> Result<()> {
        assert!(ImageReference::parse("alpine:latest")?.is_latest_tag());
        assert!(!ImageReference::parse("alpine:3.18")?.is_latest_tag());
        Ok(())
    }
}
