//! Identity traits: signing as a member and verifying endorsements.

use hotchain_types::{EndorsementEntry, Member};
use thiserror::Error;

/// Resource name under which consensus messages are endorsed.
pub const RESOURCE_CONSENSUS: &str = "CONSENSUS";

/// Errors raised by signing members and access control.
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// The signature could not be decoded.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The member's identity payload is not a usable public key.
    #[error("invalid member {member}: {reason}")]
    InvalidMember {
        /// Offending member
        member: String,
        /// Why it was rejected
        reason: String,
    },

    /// A principal was built without endorsements.
    #[error("principal for {0} has no endorsements")]
    NoEndorsements(String),

    /// Signing failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Result type for identity operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

impl From<hotchain_crypto::CryptoError> for CryptoError {
    fn from(e: hotchain_crypto::CryptoError) -> Self {
        CryptoError::SigningFailed(e.to_string())
    }
}

/// A request to authorize `message` for `resource_name` by its endorsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Resource being accessed
    pub resource_name: String,
    /// Signatures over `message`
    pub endorsements: Vec<EndorsementEntry>,
    /// Signed payload
    pub message: Vec<u8>,
}

/// The local node's signing identity.
pub trait SigningMember: Send + Sync {
    /// Identity that signatures are attributed to.
    fn member(&self) -> Member;

    /// Sign `msg`.
    fn sign(&self, msg: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Sign `msg` and wrap the result as an endorsement.
    fn endorse(&self, msg: &[u8]) -> CryptoResult<EndorsementEntry> {
        Ok(EndorsementEntry {
            signer: self.member(),
            signature: self.sign(msg)?,
        })
    }
}

/// Verifies that endorsements authorize access to a resource.
pub trait AccessControlProvider: Send + Sync {
    /// Bundle endorsements over `message` into a principal.
    fn create_principal(
        &self,
        resource_name: &str,
        endorsements: Vec<EndorsementEntry>,
        message: Vec<u8>,
    ) -> CryptoResult<Principal>;

    /// Check every endorsement of `principal`.
    ///
    /// `Ok(false)` means well-formed but not authorized.
    fn verify_principal(&self, principal: &Principal) -> CryptoResult<bool>;
}
