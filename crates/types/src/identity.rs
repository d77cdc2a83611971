//! Member identities and endorsements.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An on-chain identity: an organisation plus opaque member info.
///
/// For the built-in access control `member_info` is the SEC1 compressed
/// secp256k1 public key of the member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Organisation the member belongs to
    pub org_id: String,
    /// Identity payload (public key bytes)
    pub member_info: Vec<u8>,
}

impl Member {
    /// Create a member.
    pub fn new(org_id: impl Into<String>, member_info: Vec<u8>) -> Self {
        Self {
            org_id: org_id.into(),
            member_info,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.member_info[..self.member_info.len().min(8)];
        write!(f, "{}/{}", self.org_id, hex::encode(info))
    }
}

/// A signature together with the member that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementEntry {
    /// Who signed
    pub signer: Member,
    /// Signature bytes
    pub signature: Vec<u8>,
}
