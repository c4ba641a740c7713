//! Configuration hashing for change detection.
//!
//! A plan records the digest of the expanded desired state it was computed
//! from, so a saved plan can be matched against the configuration later.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Result, StateError};

use super::spec::Document;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be serialized.
    pub fn hash_document(&self, document: &Document) -> Result<String> {
        self.hash_serializable(document)
    }

    /// Computes a hash of any serializable value.
    ///
    /// Maps in this crate are ordered, so the JSON encoding is canonical and
    /// equal values always hash equal.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn hash_serializable<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StateError::serialization(format!("Failed to hash value: {e}")))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
