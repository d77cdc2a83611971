//! # secp256k1 ECDSA validator keys
//!
//! Validators endorse proposals and votes with secp256k1 keys. Public keys
//! travel as 33-byte SEC1 compressed points; signatures as 64-byte `r || s`.
//!
//! ```rust
//! use hotchain_crypto::ecdsa::{PrivateKey, PublicKey};
//!
//! let key = PrivateKey::random();
//! let public = PublicKey::from_sec1_bytes(&key.public_key().to_compressed()).unwrap();
//!
//! let signature = key.sign(b"proposal").unwrap();
//! assert!(public.verify(b"proposal", &signature).unwrap());
//! ```

use crate::{keccak256, CryptoError, Hash, Result};
use k256::{
    ecdsa::{
        signature::hazmat::{PrehashSigner, PrehashVerifier},
        Signature as K256Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Length of an encoded signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// ECDSA private key (32 bytes).
#[derive(Clone)]
pub struct PrivateKey {
    inner: SigningKey,
}

impl PrivateKey {
    /// Generate a random private key from the OS RNG.
    pub fn random() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        Self {
            inner: SigningKey::from(secret_key),
        }
    }

    /// Create a private key from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret_key = SecretKey::from_bytes(bytes.into())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            inner: SigningKey::from(secret_key),
        })
    }

    /// Create a private key from hex, with or without a `0x` prefix.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Self::from_bytes(&arr)
    }

    /// Raw secret bytes. Handle with care.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes().into()
    }

    /// Hex-encoded secret. Handle with care.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Derive the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// Hash `data` with Keccak-256 and sign the digest.
    pub fn sign(&self, data: &[u8]) -> Result<Signature> {
        self.sign_prehash(&keccak256(data))
    }

    /// Sign a 32-byte digest.
    pub fn sign_prehash(&self, hash: &Hash) -> Result<Signature> {
        let sig: K256Signature = self
            .inner
            .sign_prehash(hash)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        Ok(Signature::from_k256(&sig))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

/// ECDSA public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse SEC1 bytes, compressed (33) or uncompressed (65).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Parse a hex-encoded SEC1 public key.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex)?;
        Self::from_sec1_bytes(&bytes)
    }

    /// Compressed SEC1 encoding.
    pub fn to_compressed(&self) -> [u8; 33] {
        let point = self.inner.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Hex of the compressed encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_compressed())
    }

    /// Verify a signature over a 32-byte digest.
    ///
    /// A well-formed signature that does not match yields `Ok(false)`; only
    /// undecodable signatures are errors.
    pub fn verify_prehash(&self, hash: &Hash, signature: &Signature) -> Result<bool> {
        let sig = signature.to_k256()?;
        Ok(self.inner.verify_prehash(hash, &sig).is_ok())
    }

    /// Verify a signature over `data`, hashing it with Keccak-256 first.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<bool> {
        self.verify_prehash(&keccak256(data), signature)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_compressed();
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            PublicKey::from_sec1_bytes(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

/// ECDSA signature as `r || s`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; SIGNATURE_LENGTH],
}

impl Signature {
    fn from_k256(sig: &K256Signature) -> Self {
        let mut bytes = [0u8; SIGNATURE_LENGTH];
        bytes.copy_from_slice(&sig.to_bytes());
        Self { bytes }
    }

    fn to_k256(self) -> Result<K256Signature> {
        K256Signature::from_slice(&self.bytes)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    /// Decode from a byte slice of exactly [`SIGNATURE_LENGTH`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SIGNATURE_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: SIGNATURE_LENGTH,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Raw `r || s` bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Owned copy of the raw bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::encode(&self.bytes[..8]))
            .finish()
    }
}
