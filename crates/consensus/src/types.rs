//! Consensus types for chained HotStuff.
//!
//! This module defines the data structures exchanged between validators:
//! - [`Vote`] - a block vote or a new-view vote at (height, level)
//! - [`QuorumCert`] - an aggregated set of votes reaching quorum
//! - [`ProposalData`] - a block proposal carrying its justify QC
//! - [`BlockFetchMsg`] / [`BlockFetchRespMsg`] - catch-up sync
//! - [`ConsensusMsg`] - the wire envelope routed by [`MessageType`]
//! - [`ConsensusState`] / [`RoundState`] / [`RoundStateCell`] - the local
//!   state machine position

use bytes::Bytes;
use hotchain_core::{CryptoResult, SigningMember};
use hotchain_types::{Block, EndorsementEntry, Hash, ZERO_HASH};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a validator within its epoch's validator list
pub type ValidatorIndex = u32;

/// Domain separators for signatures.
///
/// A proposal signature can never be replayed as a vote signature.
pub mod domains {
    /// Domain separator for votes
    pub const VOTE: &[u8] = b"HOTCHAIN_VOTE_V1";
    /// Domain separator for proposals
    pub const PROPOSAL: &[u8] = b"HOTCHAIN_PROPOSAL_V1";
}

/// A vote for a block, or a new-view vote after a local timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Height of the voted block (or the height being worked on for new-view)
    pub height: u64,
    /// Consensus level
    pub level: u64,
    /// Epoch the vote was cast in
    pub epoch_id: u64,
    /// Voted block hash; zero for new-view votes
    pub block_id: Hash,
    /// Author's validator index
    pub author_idx: ValidatorIndex,
    /// New-view vote flag
    pub new_view: bool,
    /// Author's signature; cleared while computing the signing bytes
    pub endorsement: Option<EndorsementEntry>,
}

impl Vote {
    /// Create an unsigned block vote.
    pub fn for_block(
        height: u64,
        level: u64,
        epoch_id: u64,
        block_id: Hash,
        author_idx: ValidatorIndex,
    ) -> Self {
        Self {
            height,
            level,
            epoch_id,
            block_id,
            author_idx,
            new_view: false,
            endorsement: None,
        }
    }

    /// Create an unsigned new-view vote.
    pub fn new_view(height: u64, level: u64, epoch_id: u64, author_idx: ValidatorIndex) -> Self {
        Self {
            height,
            level,
            epoch_id,
            block_id: ZERO_HASH,
            author_idx,
            new_view: true,
            endorsement: None,
        }
    }

    /// Bytes covered by the signature: the vote re-serialized with its
    /// endorsement cleared, behind the vote domain separator.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let mut unsigned = self.clone();
        unsigned.endorsement = None;
        let mut bytes = domains::VOTE.to_vec();
        bytes.extend(bincode::serialize(&unsigned)?);
        Ok(bytes)
    }

    /// Sign the vote in place.
    pub fn sign(&mut self, signer: &dyn SigningMember) -> CryptoResult<()> {
        let bytes = self
            .signing_bytes()
            .map_err(|e| hotchain_core::CryptoError::SigningFailed(e.to_string()))?;
        self.endorsement = Some(signer.endorse(&bytes)?);
        Ok(())
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.new_view {
            write!(
                f,
                "NewView(h={}, l={}, author={})",
                self.height, self.level, self.author_idx
            )
        } else {
            write!(
                f,
                "Vote(h={}, l={}, block={}, author={})",
                self.height,
                self.level,
                hex::encode(&self.block_id[..8]),
                self.author_idx
            )
        }
    }
}

/// Quorum certificate: votes from a quorum for one block or one new-view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCert {
    /// Height of the certified block (or the stalled height for new-view)
    pub height: u64,
    /// Level the votes were cast at
    pub level: u64,
    /// Epoch of the votes
    pub epoch_id: u64,
    /// Certified block; zero for new-view certificates
    pub block_id: Hash,
    /// Whether this certifies a view change rather than a block
    pub new_view: bool,
    /// The aggregated votes
    pub votes: Vec<Vote>,
}

impl QuorumCert {
    /// A level-0 certificate for a bootstrap block. Exempt from quorum checks.
    pub fn genesis(block: &Block, epoch_id: u64) -> Self {
        Self {
            height: block.height(),
            level: 0,
            epoch_id,
            block_id: block.hash(),
            new_view: false,
            votes: Vec::new(),
        }
    }

    /// Whether this is a level-0 certificate.
    pub fn is_genesis(&self) -> bool {
        self.level == 0
    }

    /// Encode for storage in a block's additional data.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode from a block's additional data.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl fmt::Display for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QC(h={}, l={}, epoch={}, {}={}, votes={})",
            self.height,
            self.level,
            self.epoch_id,
            if self.new_view { "newview" } else { "block" },
            hex::encode(&self.block_id[..8]),
            self.votes.len()
        )
    }
}

/// A block proposal for (height, level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalData {
    /// Proposed block
    pub block: Block,
    /// Block height
    pub height: u64,
    /// Consensus level
    pub level: u64,
    /// Epoch of the proposer
    pub epoch_id: u64,
    /// Proposer's validator index
    pub proposer_idx: ValidatorIndex,
    /// Highest QC known to the proposer; certifies the parent block or a
    /// view change
    pub justify_qc: QuorumCert,
    /// Proposer's signature
    pub endorsement: Option<EndorsementEntry>,
}

#[derive(Serialize)]
struct ProposalDigest<'a> {
    height: u64,
    level: u64,
    epoch_id: u64,
    proposer_idx: ValidatorIndex,
    block_id: Hash,
    justify_qc: &'a QuorumCert,
}

impl ProposalData {
    /// Bytes covered by the proposer signature. The block is represented by
    /// its hash.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let digest = ProposalDigest {
            height: self.height,
            level: self.level,
            epoch_id: self.epoch_id,
            proposer_idx: self.proposer_idx,
            block_id: self.block.hash(),
            justify_qc: &self.justify_qc,
        };
        let mut bytes = domains::PROPOSAL.to_vec();
        bytes.extend(bincode::serialize(&digest)?);
        Ok(bytes)
    }

    /// Sign the proposal in place.
    pub fn sign(&mut self, signer: &dyn SigningMember) -> CryptoResult<()> {
        let bytes = self
            .signing_bytes()
            .map_err(|e| hotchain_core::CryptoError::SigningFailed(e.to_string()))?;
        self.endorsement = Some(signer.endorse(&bytes)?);
        Ok(())
    }
}

/// Request for `num_blocks` blocks ending at `block_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFetchMsg {
    /// Newest block wanted
    pub block_id: Hash,
    /// Height of `block_id`
    pub height: u64,
    /// How many blocks to walk back
    pub num_blocks: u32,
    /// Request id, echoed in the response
    pub req_id: u64,
    /// Requester index
    pub author_idx: ValidatorIndex,
}

/// A block with the QC that certifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPair {
    /// The block
    pub block: Block,
    /// QC whose `block_id` is the block's hash
    pub qc: QuorumCert,
}

/// Outcome of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    /// Everything requested was found
    Succeed,
    /// The responder ran out of blocks early
    NotEnough,
}

/// Response to a [`BlockFetchMsg`], newest block first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFetchRespMsg {
    /// Echo of the request id
    pub resp_id: u64,
    /// Outcome
    pub status: FetchStatus,
    /// Blocks with their certificates
    pub blocks: Vec<BlockPair>,
    /// Responder index
    pub author_idx: ValidatorIndex,
}

/// Routing key of a consensus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// [`ConsensusPayload::Proposal`]
    ProposalMessage,
    /// [`ConsensusPayload::Vote`]
    VoteMessage,
    /// [`ConsensusPayload::BlockFetch`]
    BlockFetchMessage,
    /// [`ConsensusPayload::BlockFetchResp`]
    BlockFetchRespMessage,
}

impl MessageType {
    /// Proposal and vote messages go to the protocol channel; the rest to sync.
    pub fn is_protocol(self) -> bool {
        matches!(self, MessageType::ProposalMessage | MessageType::VoteMessage)
    }
}

/// Typed consensus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusPayload {
    /// Block proposal
    Proposal(ProposalData),
    /// Vote
    Vote(Vote),
    /// Catch-up request
    BlockFetch(BlockFetchMsg),
    /// Catch-up response
    BlockFetchResp(BlockFetchRespMsg),
}

impl ConsensusPayload {
    /// Routing key.
    pub fn msg_type(&self) -> MessageType {
        match self {
            ConsensusPayload::Proposal(_) => MessageType::ProposalMessage,
            ConsensusPayload::Vote(_) => MessageType::VoteMessage,
            ConsensusPayload::BlockFetch(_) => MessageType::BlockFetchMessage,
            ConsensusPayload::BlockFetchResp(_) => MessageType::BlockFetchRespMessage,
        }
    }
}

/// Wire envelope for everything validators exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMsg {
    /// The payload
    pub payload: ConsensusPayload,
}

impl ConsensusMsg {
    /// Wrap a payload.
    pub fn new(payload: ConsensusPayload) -> Self {
        Self { payload }
    }

    /// Encode with bincode.
    pub fn encode(&self) -> Result<Bytes, bincode::Error> {
        bincode::serialize(self).map(Bytes::from)
    }

    /// Decode with bincode.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Position within a (height, level) cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusState {
    /// Waiting for (or building) the proposal
    Propose,
    /// Voted for the proposal, waiting for the next QC
    Vote,
    /// Timed out and sent a new-view vote
    NewView,
    /// Committing a block
    Commit,
}

impl fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusState::Propose => write!(f, "PROPOSE"),
            ConsensusState::Vote => write!(f, "VOTE"),
            ConsensusState::NewView => write!(f, "NEWVIEW"),
            ConsensusState::Commit => write!(f, "COMMIT"),
        }
    }
}

/// Atomic snapshot of the state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundState {
    /// Height being worked on
    pub height: u64,
    /// Current level
    pub level: u64,
    /// Current epoch
    pub epoch_id: u64,
    /// Current state
    pub state: ConsensusState,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "h={} l={} epoch={} {}",
            self.height, self.level, self.epoch_id, self.state
        )
    }
}

/// Shared, synchronized holder of the [`RoundState`].
///
/// Readers always get the full tuple from a single lock acquisition, so
/// height, level, epoch and state never come from different moments.
#[derive(Debug)]
pub struct RoundStateCell {
    inner: RwLock<RoundState>,
}

impl RoundStateCell {
    /// Start at `state`.
    pub fn new(state: RoundState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    /// Consistent copy of the current tuple.
    pub fn snapshot(&self) -> RoundState {
        *self.inner.read()
    }

    /// Replace the whole tuple.
    pub fn set(&self, state: RoundState) {
        *self.inner.write() = state;
    }

    /// Change only the state field.
    pub fn set_state(&self, state: ConsensusState) {
        self.inner.write().state = state;
    }
}
