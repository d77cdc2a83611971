//! Tests for secp256k1 validator keys

use hotchain_crypto::ecdsa::{PrivateKey, PublicKey, Signature, SIGNATURE_LENGTH};
use hotchain_crypto::{keccak256, CryptoError};

#[test]
fn test_private_key_generation() {
    let key1 = PrivateKey::random();
    let key2 = PrivateKey::random();
    assert_ne!(key1.to_bytes(), key2.to_bytes());
}

#[test]
fn test_private_key_from_hex() {
    let hex = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    let key = PrivateKey::from_hex(hex).unwrap();
    assert_eq!(key.to_hex(), &hex[2..]);
}

#[test]
fn test_private_key_from_hex_wrong_length() {
    let result = PrivateKey::from_hex("abcd");
    assert!(matches!(
        result,
        Err(CryptoError::InvalidLength { expected: 32, actual: 2 })
    ));
}

#[test]
fn test_sign_and_verify() {
    let key = PrivateKey::random();
    let public = key.public_key();

    let signature = key.sign(b"block 10").unwrap();
    assert!(public.verify(b"block 10", &signature).unwrap());
    assert!(!public.verify(b"block 11", &signature).unwrap());
}

#[test]
fn test_verify_with_other_key_fails() {
    let key = PrivateKey::random();
    let other = PrivateKey::random();

    let digest = keccak256(b"vote");
    let signature = key.sign_prehash(&digest).unwrap();
    assert!(!other.public_key().verify_prehash(&digest, &signature).unwrap());
}

#[test]
fn test_public_key_roundtrip_through_hex() {
    let public = PrivateKey::random().public_key();
    let restored = PublicKey::from_hex(&public.to_hex()).unwrap();
    assert_eq!(public, restored);
}

#[test]
fn test_public_key_serde_json() {
    let public = PrivateKey::random().public_key();
    let json = serde_json::to_string(&public).unwrap();
    assert_eq!(json, format!("\"{}\"", public.to_hex()));
    let back: PublicKey = serde_json::from_str(&json).unwrap();
    assert_eq!(back, public);
}

#[test]
fn test_signature_from_slice_rejects_bad_length() {
    assert!(Signature::from_slice(&[0u8; 10]).is_err());

    let key = PrivateKey::random();
    let sig = key.sign(b"x").unwrap();
    assert_eq!(sig.as_bytes().len(), SIGNATURE_LENGTH);
    assert_eq!(Signature::from_slice(sig.as_bytes()).unwrap(), sig);
}
