//! Chunk name validation.
//!
//! A [`ChunkValidation`] decides whether a name is well formed for its
//! hashing scheme and whether content belongs to a name. The scheme is a
//! runtime choice ([`HashScheme`] in the config), so stores hold an
//! `Arc<dyn ChunkValidation>` rather than being generic over it.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use strata_config::HashScheme;

use crate::ChunkName;

/// Name/content validation capability, one implementation per hashing scheme.
pub trait ChunkValidation: Send + Sync + fmt::Debug {
    /// Scheme identifier, used in logs.
    fn scheme(&self) -> &'static str;

    /// Compute the name of `content`.
    fn name_for(&self, content: &[u8]) -> ChunkName;

    /// Whether `name` is well formed (digest length for this scheme).
    fn is_valid(&self, name: &ChunkName) -> bool;

    /// Whether `content` may be persisted under `name`.
    fn is_valid_for_storing(&self, name: &ChunkName, content: &[u8]) -> bool {
        self.is_valid(name) && !content.is_empty() && self.name_for(content) == *name
    }

    /// Whether `content` may be cached under `name`.
    fn is_valid_for_caching(&self, name: &ChunkName, content: &[u8]) -> bool {
        self.is_valid_for_storing(name, content)
    }
}

/// BLAKE3 names (32 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Validation;

impl ChunkValidation for Blake3Validation {
    fn scheme(&self) -> &'static str {
        "blake3"
    }

    #[inline]
    fn name_for(&self, content: &[u8]) -> ChunkName {
        ChunkName::from_bytes(*blake3::hash(content).as_bytes())
    }

    fn is_valid(&self, name: &ChunkName) -> bool {
        name.len() == blake3::OUT_LEN
    }
}

/// SHA-256 names (32 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Validation;

impl ChunkValidation for Sha256Validation {
    fn scheme(&self) -> &'static str {
        "sha256"
    }

    #[inline]
    fn name_for(&self, content: &[u8]) -> ChunkName {
        ChunkName::from_bytes(Sha256::digest(content).to_vec())
    }

    fn is_valid(&self, name: &ChunkName) -> bool {
        name.len() == 32
    }
}

/// Validation for a configured hashing scheme.
pub fn validation_for(scheme: HashScheme) -> Arc<dyn ChunkValidation> {
    match scheme {
        HashScheme::Blake3 => Arc::new(Blake3Validation),
        HashScheme::Sha256 => Arc::new(Sha256Validation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_names() {
        let v = Blake3Validation;
        let name = v.name_for(b"hello");
        assert!(v.is_valid(&name));
        assert!(v.is_valid_for_storing(&name, b"hello"));
        assert!(v.is_valid_for_caching(&name, b"hello"));
        assert!(!v.is_valid_for_storing(&name, b"hellO"));
        assert!(!v.is_valid_for_storing(&name, b""));
    }

    #[test]
    fn test_wrong_length_name_is_invalid() {
        let v = Blake3Validation;
        assert!(!v.is_valid(&ChunkName::from_bytes(Vec::new())));
        assert!(!v.is_valid(&ChunkName::from_bytes(vec![0u8; 64])));
        assert!(v.is_valid(&ChunkName::from_bytes(vec![0u8; 32])));
    }

    #[test]
    fn test_sha256_known_digest() {
        let v = Sha256Validation;
        let name = v.name_for(b"abc");
        assert_eq!(
            name.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(v.is_valid_for_storing(&name, b"abc"));
    }

    #[test]
    fn test_schemes_disagree() {
        let blake = validation_for(HashScheme::Blake3);
        let sha = validation_for(HashScheme::Sha256);
        let name = blake.name_for(b"content");
        assert!(blake.is_valid_for_storing(&name, b"content"));
        assert!(!sha.is_valid_for_storing(&name, b"content"));
        assert_eq!(sha.scheme(), "sha256");
    }
}
