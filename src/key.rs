//! Content key codec mapping image references and digests to DHT keys.
//!
//! Peers advertise and look up content under a CIDv1 with the `raw` codec.
//! A digest string contributes its decoded hash directly; any other string
//! is hashed with SHA-256 first. Two inputs map to the same key iff they are
//! byte-equal after this normalization.

use cid::Cid;
use libp2p::kad::RecordKey;
use multihash::Multihash;
use sha2::{Digest as _, Sha256};

use crate::error::Result;
use crate::oci::Digest;

/// Multicodec for raw (unstructured) content.
const RAW_CODEC: u64 = 0x55;

/// Multicodec for the SHA2-256 hash function.
const SHA2_256_CODE: u64 = 0x12;

/// Returns true if `s` has the `<algorithm>:<hex>` shape of a digest.
///
/// Only recognition, not validation: a recognized prefix followed by
/// malformed hex is rejected later by [`ContentKey::new`].
pub fn is_digest(s: &str) -> bool {
    s.starts_with("sha256:")
}

/// A content key in the peer routing table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey(Cid);

impl ContentKey {
    /// Derive the content key for an image reference or digest string.
    pub fn new(key: &str) -> Result<Self> {
        let hashed: Vec<u8> = if is_digest(key) {
            Digest::parse(key)?.decoded()?
        } else {
            Sha256::digest(key.as_bytes()).to_vec()
        };
        let multihash: Multihash<64> = Multihash::wrap(SHA2_256_CODE, &hashed)?;
        Ok(Self(Cid::new_v1(RAW_CODEC, multihash)))
    }

    /// Convert to the Kademlia record key.
    ///
    /// Keyed by the multihash bytes so the key space matches provider
    /// records published by other implementations.
    pub fn to_record_key(&self) -> RecordKey {
        RecordKey::new(&self.0.hash().to_bytes())
    }

    /// The underlying CID.
    pub fn cid(&self) -> &Cid {
        &self.0
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_key_is_deterministic() {
        let a = ContentKey::new("docker.io/library/alpine:3.18").unwrap();
        let b = ContentKey::new("docker.io/library/alpine:3.18").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_record_key(), b.to_record_key());
    }

    #[test]
    fn test_distinct_references_distinct_keys() {
        let a = ContentKey::new("docker.io/library/alpine:3.18").unwrap();
        let b = ContentKey::new("docker.io/library/alpine:3.19").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_digest_and_reference_keys_differ() {
        // The digest contributes its decoded bytes; the same string hashed
        // as a reference would produce a different key, so the two forms
        // only collide when they normalize to identical bytes.
        let digest = format!("sha256:{HEX}");
        let a = ContentKey::new(&digest).unwrap();
        let b = ContentKey::new(&digest).unwrap();
        assert_eq!(a, b);

        let as_reference = ContentKey::new("not-a-digest").unwrap();
        assert_ne!(a, as_reference);
    }

    #[test]
    fn test_key_shape() {
        let key = ContentKey::new(&format!("sha256:{HEX}")).unwrap();
        assert_eq!(key.cid().version(), cid::Version::V1);
        assert_eq!(key.cid().codec(), RAW_CODEC);
        assert_eq!(key.cid().hash().code(), SHA2_256_CODE);
        assert_eq!(key.cid().hash().digest(), hex::decode(HEX).unwrap());
    }

    #[test]
    fn test_reference_key_hashes_input() {
        let key = ContentKey::new("ghcr.io/foo/bar:v1").unwrap();
        let expected = Sha256::digest("ghcr.io/foo/bar:v1".as_bytes());
        assert_eq!(key.cid().hash().digest(), expected.as_slice());
    }

    #[test]
    fn test_malformed_digest_rejected() {
        assert!(ContentKey::new("sha256:zzzz").is_err());
        assert!(ContentKey::new(&format!("sha256:{}", &HEX[..10])).is_err());
    }

    #[test]
    fn test_is_digest() {
        assert!(is_digest(&format!("sha256:{HEX}")));
        assert!(is_digest("sha256:nonsense"));
        assert!(!is_digest("docker.io/library/alpine:latest"));
    }
}
