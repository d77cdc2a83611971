//! secp256k1-backed signing member and access control.
//!
//! A member's `member_info` is its compressed public key; an endorsement is
//! valid when its signature verifies against that key over the principal's
//! message.

use hotchain_crypto::ecdsa::{PrivateKey, PublicKey, Signature};
use hotchain_types::{EndorsementEntry, Member};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::debug;

use crate::traits::{AccessControlProvider, CryptoError, CryptoResult, Principal, SigningMember};

/// Local signing identity holding a secp256k1 key.
pub struct KeySigningMember {
    org_id: String,
    key: PrivateKey,
}

impl KeySigningMember {
    /// Create a signing member for `org_id`.
    pub fn new(org_id: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            org_id: org_id.into(),
            key,
        }
    }

    /// Public key of this member.
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }
}

impl SigningMember for KeySigningMember {
    fn member(&self) -> Member {
        Member::new(self.org_id.clone(), self.key.public_key().to_compressed().to_vec())
    }

    fn sign(&self, msg: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(self.key.sign(msg)?.to_vec())
    }
}

/// Access control that checks endorsement signatures, optionally
/// restricted to a set of trusted members.
#[derive(Default)]
pub struct KeyAccessControl {
    trusted: RwLock<HashSet<Member>>,
}

impl KeyAccessControl {
    /// Accept any correctly signed endorsement.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept endorsements only from `members`.
    pub fn with_trusted(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            trusted: RwLock::new(members.into_iter().collect()),
        }
    }

    /// Add a trusted member.
    pub fn trust(&self, member: Member) {
        self.trusted.write().insert(member);
    }

    fn verify_endorsement(&self, entry: &EndorsementEntry, message: &[u8]) -> CryptoResult<bool> {
        {
            let trusted = self.trusted.read();
            if !trusted.is_empty() && !trusted.contains(&entry.signer) {
                debug!(signer = %entry.signer, "endorsement from untrusted member");
                return Ok(false);
            }
        }
        let key = PublicKey::from_sec1_bytes(&entry.signer.member_info).map_err(|e| {
            CryptoError::InvalidMember {
                member: entry.signer.to_string(),
                reason: e.to_string(),
            }
        })?;
        let signature = Signature::from_slice(&entry.signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        Ok(key.verify(message, &signature)?)
    }
}

impl AccessControlProvider for KeyAccessControl {
    fn create_principal(
        &self,
        resource_name: &str,
        endorsements: Vec<EndorsementEntry>,
        message: Vec<u8>,
    ) -> CryptoResult<Principal> {
        if endorsements.is_empty() {
            return Err(CryptoError::NoEndorsements(resource_name.to_string()));
        }
        Ok(Principal {
            resource_name: resource_name.to_string(),
            endorsements,
            message,
        })
    }

    fn verify_principal(&self, principal: &Principal) -> CryptoResult<bool> {
        for entry in &principal.endorsements {
            if !self.verify_endorsement(entry, &principal.message)? {
                return Ok(false);
            }
        }
        Ok(!principal.endorsements.is_empty())
    }
}
