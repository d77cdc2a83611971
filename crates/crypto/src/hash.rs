//! Keccak-256 hashing helpers.
//!
//! For incremental hashing of structured content (block fingerprints, header
//! hashes) use [`Hasher`]:
//!
//! ```rust
//! use hotchain_crypto::Hasher;
//!
//! let mut hasher = Hasher::new();
//! hasher.update(b"chain1");
//! hasher.update_u64(42);
//! let digest = hasher.finalize();
//! assert_eq!(digest.len(), 32);
//! ```

use sha3::{Digest, Keccak256};

use crate::Hash;

/// Compute the Keccak-256 hash of `data`.
#[inline]
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the Keccak-256 hash of several inputs as if they were concatenated.
#[inline]
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// A streaming Keccak-256 hasher with length-prefixed field helpers.
///
/// Variable-length fields are written with a `u32` length prefix so that
/// adjacent fields cannot be shifted into each other.
#[derive(Clone)]
pub struct Hasher {
    inner: Keccak256,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    /// Create a new hasher.
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: Keccak256::new(),
        }
    }

    /// Feed raw bytes.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Feed a length-prefixed byte field.
    #[inline]
    pub fn update_field(&mut self, data: &[u8]) {
        self.inner.update((data.len() as u32).to_be_bytes());
        self.inner.update(data);
    }

    /// Feed a big-endian `u64`.
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.inner.update(value.to_be_bytes());
    }

    /// Feed a big-endian `i64`.
    #[inline]
    pub fn update_i64(&mut self, value: i64) {
        self.inner.update(value.to_be_bytes());
    }

    /// Consume the hasher and return the digest.
    #[inline]
    pub fn finalize(self) -> Hash {
        self.inner.finalize().into()
    }
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_concat_matches_single_buffer() {
        assert_eq!(keccak256_concat(&[b"hello", b" ", b"world"]), keccak256(b"hello world"));
    }

    #[test]
    fn test_field_prefix_separates_boundaries() {
        let mut a = Hasher::new();
        a.update_field(b"ab");
        a.update_field(b"c");

        let mut b = Hasher::new();
        b.update_field(b"a");
        b.update_field(b"bc");

        assert_ne!(a.finalize(), b.finalize());
    }
}
