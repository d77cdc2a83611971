//! Quorum certificate validation and vote signature checks.
//!
//! [`validate_qc`] is the single admission check for certificates, whether
//! they arrive inside a proposal, form locally in the MsgPool, come back
//! from a block fetch, or are read out of a committed block's additional
//! data.

use std::collections::HashSet;

use hotchain_core::{AccessControlProvider, RESOURCE_CONSENSUS};
use hotchain_types::{EndorsementEntry, Member};
use thiserror::Error;
use tracing::{debug, warn};

use crate::governance::{Epoch, EpochView};
use crate::types::{ProposalData, QuorumCert, ValidatorIndex, Vote};

/// Certificate and signature validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QcError {
    /// Vote author index is not in the epoch's validator set
    #[error("unknown vote author {0}")]
    UnknownAuthor(ValidatorIndex),

    /// A vote does not match the QC's height, level or epoch
    #[error("vote from {author} at h={vote_height} l={vote_level} does not match qc at h={qc_height} l={qc_level}")]
    VoteMismatch {
        /// Author of the mismatched vote
        author: ValidatorIndex,
        /// Vote height
        vote_height: u64,
        /// Vote level
        vote_level: u64,
        /// QC height
        qc_height: u64,
        /// QC level
        qc_level: u64,
    },

    /// Two votes with the same author
    #[error("duplicate vote from author {0}")]
    DuplicateVote(ValidatorIndex),

    /// A signature failed to verify or was signed by the wrong member
    #[error("invalid signature from author {0}")]
    InvalidSignature(ValidatorIndex),

    /// Not enough matching votes
    #[error("insufficient quorum: {got} of {needed} (new_view={new_view})")]
    InsufficientQuorum {
        /// Matching votes
        got: usize,
        /// Required votes
        needed: usize,
        /// Whether the QC is a new-view certificate
        new_view: bool,
    },

    /// The QC references an epoch that is neither current nor the one just before
    #[error("qc epoch {qc_epoch} is not usable in epoch {current}")]
    EpochMismatch {
        /// Epoch named by the QC
        qc_epoch: u64,
        /// Local epoch
        current: u64,
    },
}

/// Result type for QC validation
pub type QcResult<T> = Result<T, QcError>;

/// Vote tallies inside a QC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoteCount {
    /// Votes with `new_view == true`
    pub new_view: usize,
    /// Block votes for the QC's block
    pub voted_block: usize,
}

/// Count new-view votes and votes for `qc.block_id`.
pub fn count_votes(qc: &QuorumCert) -> VoteCount {
    qc.votes.iter().fold(VoteCount::default(), |mut count, vote| {
        if vote.new_view {
            count.new_view += 1;
        } else if vote.block_id == qc.block_id {
            count.voted_block += 1;
        }
        count
    })
}

/// Check that `endorsement` was produced by `expected` over `message`.
pub fn verify_endorsement(
    ac: &dyn AccessControlProvider,
    expected: &Member,
    endorsement: Option<&EndorsementEntry>,
    message: Vec<u8>,
) -> bool {
    let Some(entry) = endorsement else {
        return false;
    };
    if &entry.signer != expected {
        return false;
    }
    let principal = match ac.create_principal(RESOURCE_CONSENSUS, vec![entry.clone()], message) {
        Ok(principal) => principal,
        Err(e) => {
            debug!(error = %e, "failed to create principal");
            return false;
        }
    };
    match ac.verify_principal(&principal) {
        Ok(ok) => ok,
        Err(e) => {
            debug!(error = %e, "principal verification failed");
            false
        }
    }
}

/// Verify a vote's author and signature against `epoch`.
pub fn verify_vote(vote: &Vote, epoch: &Epoch, ac: &dyn AccessControlProvider) -> QcResult<()> {
    let validator = epoch
        .validator(vote.author_idx)
        .ok_or(QcError::UnknownAuthor(vote.author_idx))?;
    let message = vote
        .signing_bytes()
        .map_err(|_| QcError::InvalidSignature(vote.author_idx))?;
    if !verify_endorsement(ac, &validator.member, vote.endorsement.as_ref(), message) {
        return Err(QcError::InvalidSignature(vote.author_idx));
    }
    Ok(())
}

/// Verify a proposal's signature against the validator at `proposer_idx`.
pub fn verify_proposal(
    proposal: &ProposalData,
    epoch: &Epoch,
    ac: &dyn AccessControlProvider,
) -> QcResult<()> {
    let validator = epoch
        .validator(proposal.proposer_idx)
        .ok_or(QcError::UnknownAuthor(proposal.proposer_idx))?;
    let message = proposal
        .signing_bytes()
        .map_err(|_| QcError::InvalidSignature(proposal.proposer_idx))?;
    if !verify_endorsement(ac, &validator.member, proposal.endorsement.as_ref(), message) {
        return Err(QcError::InvalidSignature(proposal.proposer_idx));
    }
    Ok(())
}

/// Validate `qc` against the local epochs.
///
/// A QC from the epoch immediately before the current one is accepted
/// without further checks while the switch settles.
pub fn validate_qc(
    qc: &QuorumCert,
    epochs: &EpochView,
    ac: &dyn AccessControlProvider,
) -> QcResult<()> {
    let epoch = &epochs.current;
    if qc.epoch_id != epoch.epoch_id {
        if qc.epoch_id.saturating_add(1) == epoch.epoch_id {
            debug!(
                qc_epoch = qc.epoch_id,
                current = epoch.epoch_id,
                "accepting qc from previous epoch"
            );
            return Ok(());
        }
        // Bootstrap certificates carry no votes and may predate any epoch
        if qc.is_genesis() && qc.votes.is_empty() {
            return Ok(());
        }
        return Err(QcError::EpochMismatch {
            qc_epoch: qc.epoch_id,
            current: epoch.epoch_id,
        });
    }

    let mut seen = HashSet::with_capacity(qc.votes.len());
    for vote in &qc.votes {
        if epoch.validator(vote.author_idx).is_none() {
            return Err(QcError::UnknownAuthor(vote.author_idx));
        }
        if vote.height != qc.height || vote.level != qc.level || vote.epoch_id != qc.epoch_id {
            return Err(QcError::VoteMismatch {
                author: vote.author_idx,
                vote_height: vote.height,
                vote_level: vote.level,
                qc_height: qc.height,
                qc_level: qc.level,
            });
        }
        if !seen.insert(vote.author_idx) {
            warn!(author = vote.author_idx, height = qc.height, level = qc.level, "duplicate vote in qc");
            return Err(QcError::DuplicateVote(vote.author_idx));
        }
        verify_vote(vote, epoch, ac)?;
    }

    if qc.level == 0 {
        return Ok(());
    }

    let count = count_votes(qc);
    let got = if qc.new_view {
        count.new_view
    } else {
        count.voted_block
    };
    if got >= epoch.quorum {
        Ok(())
    } else {
        Err(QcError::InsufficientQuorum {
            got,
            needed: epoch.quorum,
            new_view: qc.new_view,
        })
    }
}
