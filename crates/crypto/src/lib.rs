//! # Hotchain Crypto
//!
//! Cryptographic primitives shared by every hotchain crate.
//!
//! - **Keccak-256 hashing** for block hashes, fingerprints and vote digests
//! - **secp256k1 ECDSA** keys used by validators to endorse proposals and votes
//!
//! ## Example
//!
//! ```rust
//! use hotchain_crypto::{keccak256, ecdsa::PrivateKey};
//!
//! let digest = keccak256(b"vote payload");
//!
//! let key = PrivateKey::random();
//! let signature = key.sign_prehash(&digest).unwrap();
//! assert!(key.public_key().verify_prehash(&digest, &signature).unwrap());
//! ```

pub mod ecdsa;
pub mod hash;

pub use ecdsa::{PrivateKey, PublicKey, Signature};
pub use hash::{keccak256, keccak256_concat, Hasher};

/// Common type alias for 32-byte hash
pub type Hash = [u8; 32];

/// The all-zero hash, used for "no block" references.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid input length
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexError(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::HexError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_known_vector() {
        assert_eq!(
            hex::encode(keccak256(b"hello")),
            "1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }
}
