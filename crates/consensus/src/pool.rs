//! Vote and proposal collection (MsgPool).
//!
//! Votes are grouped per (height, level). Within a level each author may
//! cast one block vote and one new-view vote. A QC is produced exactly once,
//! by the vote that first brings a block (or the new-view set) to quorum.
//!
//! Signatures are checked by the caller before votes reach the pool.

use std::collections::{BTreeMap, HashMap, HashSet};

use hotchain_types::Hash;
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{ProposalData, QuorumCert, ValidatorIndex, Vote};

/// MsgPool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// An author voted for two different blocks at the same level
    #[error("duplicate vote from {author} at h={height} l={level}")]
    DuplicateVote {
        /// Author
        author: ValidatorIndex,
        /// Height
        height: u64,
        /// Level
        level: u64,
    },

    /// A second, different proposal for the same (height, level)
    #[error("conflicting proposal at h={height} l={level}")]
    ConflictingProposal {
        /// Height
        height: u64,
        /// Level
        level: u64,
    },
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Votes cast at one (height, level).
#[derive(Debug, Clone, Default)]
pub struct LevelVoteSet {
    votes: HashMap<(ValidatorIndex, bool), Vote>,
    by_block: HashMap<Hash, Vec<ValidatorIndex>>,
    new_view: Vec<ValidatorIndex>,
    certified: HashSet<(bool, Hash)>,
}

impl LevelVoteSet {
    /// Add `vote`; returns a QC when it completes a quorum for the first time.
    pub fn add_vote(&mut self, vote: Vote, quorum: usize) -> PoolResult<Option<QuorumCert>> {
        let key = (vote.author_idx, vote.new_view);
        if let Some(existing) = self.votes.get(&key) {
            if existing.block_id == vote.block_id {
                trace!(author = vote.author_idx, "ignoring repeated vote");
                return Ok(None);
            }
            return Err(PoolError::DuplicateVote {
                author: vote.author_idx,
                height: vote.height,
                level: vote.level,
            });
        }

        let (height, level, epoch_id, block_id, new_view) =
            (vote.height, vote.level, vote.epoch_id, vote.block_id, vote.new_view);
        let tally = if new_view {
            self.new_view.push(vote.author_idx);
            self.new_view.len()
        } else {
            let voters = self.by_block.entry(block_id).or_default();
            voters.push(vote.author_idx);
            voters.len()
        };
        self.votes.insert(key, vote);

        if tally < quorum || !self.certified.insert((new_view, block_id)) {
            return Ok(None);
        }

        let voters = if new_view {
            &self.new_view
        } else {
            &self.by_block[&block_id]
        };
        let votes = voters
            .iter()
            .filter_map(|author| self.votes.get(&(*author, new_view)).cloned())
            .collect();

        debug!(
            height,
            level,
            new_view,
            block_hash = hex::encode(&block_id[..8]),
            votes = tally,
            quorum,
            "Quorum reached"
        );

        Ok(Some(QuorumCert {
            height,
            level,
            epoch_id,
            block_id,
            new_view,
            votes,
        }))
    }

    /// Total votes held.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Whether no vote was added.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Block votes for `block_id`.
    pub fn votes_for(&self, block_id: &Hash) -> usize {
        self.by_block.get(block_id).map_or(0, Vec::len)
    }

    /// New-view votes.
    pub fn new_view_votes(&self) -> usize {
        self.new_view.len()
    }
}

/// Votes and proposals above the committed height.
#[derive(Debug, Default)]
pub struct MsgPool {
    votes: BTreeMap<(u64, u64), LevelVoteSet>,
    proposals: BTreeMap<(u64, u64), ProposalData>,
}

impl MsgPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a verified vote. See [`LevelVoteSet::add_vote`].
    pub fn add_vote(&mut self, vote: Vote, quorum: usize) -> PoolResult<Option<QuorumCert>> {
        self.votes
            .entry((vote.height, vote.level))
            .or_default()
            .add_vote(vote, quorum)
    }

    /// Votes at (height, level).
    pub fn level_votes(&self, height: u64, level: u64) -> Option<&LevelVoteSet> {
        self.votes.get(&(height, level))
    }

    /// Record a proposal. Returns `false` when the same proposal was already
    /// recorded.
    pub fn insert_proposal(&mut self, proposal: &ProposalData) -> PoolResult<bool> {
        let key = (proposal.height, proposal.level);
        match self.proposals.get(&key) {
            Some(existing) if existing.block.hash() == proposal.block.hash() => Ok(false),
            Some(_) => Err(PoolError::ConflictingProposal {
                height: proposal.height,
                level: proposal.level,
            }),
            None => {
                self.proposals.insert(key, proposal.clone());
                Ok(true)
            }
        }
    }

    /// Proposal at (height, level).
    pub fn proposal(&self, height: u64, level: u64) -> Option<&ProposalData> {
        self.proposals.get(&(height, level))
    }

    /// Drop everything at or below `committed_height`.
    pub fn prune(&mut self, committed_height: u64) {
        let before = self.votes.len() + self.proposals.len();
        self.votes.retain(|(h, _), _| *h > committed_height);
        self.proposals.retain(|(h, _), _| *h > committed_height);
        let removed = before - (self.votes.len() + self.proposals.len());
        if removed > 0 {
            trace!(committed_height, removed, "pruned msg pool");
        }
    }

    /// Number of (height, level) slots holding votes.
    pub fn vote_levels(&self) -> usize {
        self.votes.len()
    }
}
