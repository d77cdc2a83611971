//! Chained-HotStuff state machine (SMR).
//!
//! The SMR cycles through `PROPOSE -> VOTE -> (NEWVIEW) -> COMMIT` for each
//! (height, level):
//!
//! 1. **Propose**: the elected proposer asks the core engine for a block
//!    ([`SmrAction::RequestProposal`]) and broadcasts it with its highest QC
//! 2. **Vote**: validators check the proposal and send a block vote to the
//!    proposer of the next level
//! 3. **New view**: on a local timeout a validator broadcasts a new-view
//!    vote; a quorum of them advances the level without a block
//! 4. **Commit**: a QC whose block, parent and grandparent sit at
//!    consecutive levels commits the grandparent and its uncommitted
//!    ancestors
//!
//! Handlers never touch the network. They return [`SmrAction`]s that the
//! engine executes after releasing the SMR lock.

use std::sync::Arc;

use hotchain_core::{
    AccessControlProvider, BlockError, BlockVerifier, CryptoError, ProposeState, SigningMember,
    VerifyMode,
};
use hotchain_types::{Block, Hash};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::chain_store::{ChainStore, ChainStoreError};
use crate::governance::{Epoch, EpochView, GovernanceError, GovernanceProvider};
use crate::pool::{MsgPool, PoolError};
use crate::proposer::ProposerSelection;
use crate::qc::{validate_qc, verify_proposal, verify_vote, QcError};
use crate::timer::{TimeoutConfig, TimerEvent};
use crate::types::{
    BlockFetchMsg, ConsensusPayload, ConsensusState, ProposalData, QuorumCert, RoundState,
    RoundStateCell, ValidatorIndex, Vote,
};
use crate::wal::{ConsensusWal, WalError, WalRecord};

/// Per-message failures. Logged and dropped by the engine, never fatal.
#[derive(Debug, Error)]
pub enum SmrError {
    /// Message for a position the SMR has moved past
    #[error("stale message at h={height} l={level} (current h={current_height} l={current_level})")]
    Stale {
        /// Message height
        height: u64,
        /// Message level
        level: u64,
        /// Local height
        current_height: u64,
        /// Local level
        current_level: u64,
    },

    /// Message from another epoch
    #[error("message epoch {got} does not match current epoch {current}")]
    WrongEpoch {
        /// Message epoch
        got: u64,
        /// Local epoch
        current: u64,
    },

    /// Proposal from a validator not elected for its (height, level)
    #[error("proposer {got} is not elected at h={height} l={level} (expected {expected})")]
    WrongProposer {
        /// Height
        height: u64,
        /// Level
        level: u64,
        /// Elected proposer
        expected: ValidatorIndex,
        /// Claimed proposer
        got: ValidatorIndex,
    },

    /// Malformed proposal
    #[error("invalid proposal at h={height} l={level}: {reason}")]
    InvalidProposal {
        /// Height
        height: u64,
        /// Level
        level: u64,
        /// Reason
        reason: String,
    },

    /// Malformed block fetch response
    #[error("invalid fetch response: {0}")]
    InvalidFetch(String),

    /// This node already voted at or above the proposal's level
    #[error("already voted at h={height} l={level}")]
    AlreadyVoted {
        /// Height
        height: u64,
        /// Level
        level: u64,
    },

    /// This node already proposed at this level
    #[error("already proposed at h={height} l={level}")]
    AlreadyProposed {
        /// Height
        height: u64,
        /// Level
        level: u64,
    },

    /// Proposal conflicts with the locked QC
    #[error("proposal justify level {justify_level} is below locked level {locked_level}")]
    UnsafeProposal {
        /// Justify QC level
        justify_level: u64,
        /// Locked QC level
        locked_level: u64,
    },

    /// Local node is not in the validator set
    #[error("local node is not a validator in epoch {0}")]
    NotValidator(u64),

    /// Certificate validation failed
    #[error(transparent)]
    Qc(#[from] QcError),

    /// Pool rejected a message
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Chain store rejected an operation
    #[error(transparent)]
    ChainStore(#[from] ChainStoreError),

    /// Block verification failed
    #[error(transparent)]
    Block(#[from] BlockError),

    /// WAL failure (including equivocation guard)
    #[error(transparent)]
    Wal(#[from] WalError),

    /// Signing failed
    #[error(transparent)]
    Signing(#[from] CryptoError),

    /// Governance lookup failed
    #[error(transparent)]
    Governance(#[from] GovernanceError),
}

/// Result type for SMR handlers
pub type SmrResult<T> = Result<T, SmrError>;

/// Side effects requested by the SMR.
#[derive(Debug, Clone, PartialEq)]
pub enum SmrAction {
    /// Send to every other validator
    Broadcast(ConsensusPayload),
    /// Send to one validator
    SendTo {
        /// Destination index
        to: ValidatorIndex,
        /// Message
        payload: ConsensusPayload,
    },
    /// Arm the round timer
    ScheduleTimer(TimerEvent),
    /// Ask the core engine for a block to propose
    RequestProposal(ProposeState),
}

/// Voting rules that keep a validator from equivocating or reverting a lock.
#[derive(Debug, Clone)]
pub struct SafetyRules {
    last_voted_level: u64,
    locked_qc: QuorumCert,
}

impl SafetyRules {
    /// Start with `locked_qc` and no vote above `last_voted_level`.
    pub fn new(locked_qc: QuorumCert, last_voted_level: u64) -> Self {
        Self {
            last_voted_level,
            locked_qc,
        }
    }

    /// Highest level this node voted at (block or new-view).
    pub fn last_voted_level(&self) -> u64 {
        self.last_voted_level
    }

    /// QC this node is locked on.
    pub fn locked_qc(&self) -> &QuorumCert {
        &self.locked_qc
    }

    /// Whether a block vote at `level` justified by `justify` is allowed.
    pub fn check_vote(
        &self,
        height: u64,
        level: u64,
        justify: &QuorumCert,
        extends_lock: bool,
    ) -> SmrResult<()> {
        if level <= self.last_voted_level {
            return Err(SmrError::AlreadyVoted { height, level });
        }
        if justify.level < self.locked_qc.level && !extends_lock {
            return Err(SmrError::UnsafeProposal {
                justify_level: justify.level,
                locked_level: self.locked_qc.level,
            });
        }
        Ok(())
    }

    /// Mark `level` as used by a block or new-view vote.
    pub fn record_vote(&mut self, level: u64) {
        self.last_voted_level = self.last_voted_level.max(level);
    }

    /// Lock on `qc` if it is higher than the current lock.
    pub fn update_lock(&mut self, qc: &QuorumCert) {
        if qc.level > self.locked_qc.level {
            trace!(level = qc.level, height = qc.height, "Updating lock");
            self.locked_qc = qc.clone();
        }
    }
}

/// Collaborators the SMR calls synchronously.
#[derive(Clone)]
pub struct SmrDeps {
    /// Local node id, used to find the local validator index
    pub node_id: String,
    /// Local signer
    pub signer: Arc<dyn SigningMember>,
    /// Endorsement verification
    pub ac: Arc<dyn AccessControlProvider>,
    /// Block checks before voting
    pub verifier: Arc<dyn BlockVerifier>,
    /// Epoch source
    pub governance: Arc<dyn GovernanceProvider>,
    /// Write-ahead log
    pub wal: Arc<ConsensusWal>,
}

/// SMR tuning.
#[derive(Debug, Clone)]
pub struct SmrConfig {
    /// Proposer election scheme
    pub selection: ProposerSelection,
    /// Default timeouts, overridden by governance
    pub timeouts: TimeoutConfig,
    /// Maximum blocks per fetch response
    pub fetch_batch_size: u32,
}

impl Default for SmrConfig {
    fn default() -> Self {
        Self {
            selection: ProposerSelection::RoundRobin,
            timeouts: TimeoutConfig::default(),
            fetch_batch_size: 16,
        }
    }
}

/// The chained-HotStuff state machine.
pub struct ChainedBftSmr {
    pub(crate) deps: SmrDeps,
    pub(crate) config: SmrConfig,
    pub(crate) chain_store: ChainStore,
    pub(crate) pool: MsgPool,
    pub(crate) safety: SafetyRules,
    pub(crate) epochs: Arc<RwLock<EpochView>>,
    pub(crate) round: Arc<RoundStateCell>,
    pub(crate) last_proposed_level: u64,
    pub(crate) pending_proposal: Option<ProposalData>,
    pub(crate) pending_qc: Option<QuorumCert>,
    pub(crate) next_req_id: u64,
}

impl ChainedBftSmr {
    /// Build the SMR on top of an opened chain store.
    ///
    /// The starting position is one level above the chain store's current
    /// QC, at the height after its block.
    pub fn new(deps: SmrDeps, config: SmrConfig, chain_store: ChainStore) -> SmrResult<Self> {
        let qc = chain_store.get_current_qc().clone();
        let height = qc.height + 1;
        let contract = deps.governance.governance_at(height)?;
        let epoch = Epoch::new(contract, &deps.node_id, config.selection, &config.timeouts)?;
        if epoch.local_index.is_none() {
            warn!(node_id = %deps.node_id, epoch = epoch.epoch_id, "local node is not a validator, observing only");
        }

        let round = RoundState {
            height,
            level: qc.level + 1,
            epoch_id: epoch.epoch_id,
            state: ConsensusState::Propose,
        };
        let last_voted = deps.wal.last_voted_level().max(qc.level);
        info!(%round, quorum = epoch.quorum, validators = epoch.len(), "SMR initialized");

        Ok(Self {
            safety: SafetyRules::new(qc, last_voted),
            deps,
            config,
            chain_store,
            pool: MsgPool::new(),
            epochs: Arc::new(RwLock::new(EpochView::new(epoch))),
            round: Arc::new(RoundStateCell::new(round)),
            last_proposed_level: 0,
            pending_proposal: None,
            pending_qc: None,
            next_req_id: 0,
        })
    }

    /// Shared round state cell.
    pub fn round_cell(&self) -> Arc<RoundStateCell> {
        self.round.clone()
    }

    /// Consistent (height, level, epoch, state).
    pub fn round_state(&self) -> RoundState {
        self.round.snapshot()
    }

    /// Shared epoch view.
    pub fn epochs(&self) -> Arc<RwLock<EpochView>> {
        self.epochs.clone()
    }

    /// Current epoch.
    pub fn epoch(&self) -> Arc<Epoch> {
        self.epochs.read().current.clone()
    }

    /// The chain store.
    pub fn chain_store(&self) -> &ChainStore {
        &self.chain_store
    }

    /// The message pool.
    pub fn pool(&self) -> &MsgPool {
        &self.pool
    }

    /// Safety state.
    pub fn safety(&self) -> &SafetyRules {
        &self.safety
    }

    /// Arm the first round.
    pub fn start(&mut self) -> Vec<SmrAction> {
        let round = self.round.snapshot();
        self.enter_level(round.height, round.level)
    }

    /// Feed WAL records back in after a restart. Outputs are discarded.
    pub fn replay(&mut self, records: Vec<WalRecord>) {
        let local = self.epoch().local_index;
        for record in records {
            match record {
                WalRecord::Vote(vote) => {
                    if Some(vote.author_idx) == local {
                        self.safety.record_vote(vote.level);
                    }
                }
                WalRecord::Proposal(proposal) => {
                    let (height, level) = (proposal.height, proposal.level);
                    if Some(proposal.proposer_idx) == local {
                        self.last_proposed_level = self.last_proposed_level.max(level);
                    }
                    if let Err(e) = self.process_proposal(proposal) {
                        debug!(height, level, error = %e, "replayed proposal not applied");
                    }
                }
            }
        }
        info!(round = %self.round.snapshot(), "WAL replay finished");
    }

    fn enter_level(&mut self, height: u64, level: u64) -> Vec<SmrAction> {
        let epoch = self.epoch();
        self.round.set(RoundState {
            height,
            level,
            epoch_id: epoch.epoch_id,
            state: ConsensusState::Propose,
        });
        let qc = self.chain_store.get_current_qc();
        let (qc_level, parent) = (qc.level, qc.block_id);
        debug!(height, level, epoch = epoch.epoch_id, "Entering level");

        let mut actions = vec![SmrAction::ScheduleTimer(TimerEvent {
            height,
            level,
            epoch_id: epoch.epoch_id,
            state: ConsensusState::Propose,
            duration: epoch.timeouts.timeout_for(level, qc_level),
        })];
        actions.extend(self.process_new_propose(height, level, parent));
        actions
    }

    /// Request a block when the local node is the proposer at (height, level).
    pub fn process_new_propose(&mut self, height: u64, level: u64, parent: Hash) -> Vec<SmrAction> {
        let epoch = self.epoch();
        if !epoch.is_local_proposer(height, level) || level <= self.last_proposed_level {
            return Vec::new();
        }
        info!(height, level, parent = hex::encode(&parent[..8]), "Local node is proposer, requesting block");
        vec![SmrAction::RequestProposal(ProposeState {
            height,
            level,
            pre_block_hash: parent,
        })]
    }

    /// Wrap a block built by the core engine into a signed proposal.
    pub fn process_proposed_block(&mut self, block: Block) -> SmrResult<Vec<SmrAction>> {
        let round = self.round.snapshot();
        let epoch = self.epoch();
        let local = epoch
            .local_index
            .ok_or(SmrError::NotValidator(epoch.epoch_id))?;

        if block.height() != round.height {
            return Err(SmrError::Stale {
                height: block.height(),
                level: round.level,
                current_height: round.height,
                current_level: round.level,
            });
        }
        let expected = epoch.proposer_for(round.height, round.level);
        if expected != local {
            return Err(SmrError::WrongProposer {
                height: round.height,
                level: round.level,
                expected,
                got: local,
            });
        }
        if round.level <= self.last_proposed_level {
            return Err(SmrError::AlreadyProposed {
                height: round.height,
                level: round.level,
            });
        }
        let justify_qc = self.chain_store.get_current_qc().clone();
        if block.header.pre_block_hash != justify_qc.block_id {
            return Err(SmrError::InvalidProposal {
                height: round.height,
                level: round.level,
                reason: "block does not extend the highest qc".to_string(),
            });
        }

        let mut proposal = ProposalData {
            block,
            height: round.height,
            level: round.level,
            epoch_id: epoch.epoch_id,
            proposer_idx: local,
            justify_qc,
            endorsement: None,
        };
        proposal.sign(self.deps.signer.as_ref())?;
        self.deps.wal.write_proposal(&proposal)?;
        self.last_proposed_level = round.level;

        info!(
            height = proposal.height,
            level = proposal.level,
            block_hash = hex::encode(&proposal.block.hash()[..8]),
            txs = proposal.block.txs.len(),
            "Proposing block"
        );

        let mut actions = vec![SmrAction::Broadcast(ConsensusPayload::Proposal(
            proposal.clone(),
        ))];
        actions.extend(self.process_proposal(proposal)?);
        Ok(actions)
    }

    /// Validate a proposal and vote for it.
    pub fn process_proposal(&mut self, proposal: ProposalData) -> SmrResult<Vec<SmrAction>> {
        let round = self.round.snapshot();
        let epoch = self.epoch();
        let (height, level) = (proposal.height, proposal.level);

        if proposal.epoch_id != epoch.epoch_id {
            return Err(SmrError::WrongEpoch {
                got: proposal.epoch_id,
                current: epoch.epoch_id,
            });
        }
        if level < round.level || height <= self.chain_store.get_commit_height() {
            return Err(SmrError::Stale {
                height,
                level,
                current_height: round.height,
                current_level: round.level,
            });
        }

        let block = &proposal.block;
        let invalid = |reason: &str| SmrError::InvalidProposal {
            height,
            level,
            reason: reason.to_string(),
        };
        if block.height() != height {
            return Err(invalid("block height does not match proposal"));
        }
        if block.compute_hash() != block.hash() {
            return Err(invalid("block hash mismatch"));
        }
        let expected = epoch.proposer_for(height, level);
        if proposal.proposer_idx != expected {
            return Err(SmrError::WrongProposer {
                height,
                level,
                expected,
                got: proposal.proposer_idx,
            });
        }
        verify_proposal(&proposal, &epoch, self.deps.ac.as_ref())?;

        let justify = proposal.justify_qc.clone();
        if justify.new_view
            || justify.block_id != block.header.pre_block_hash
            || justify.height + 1 != height
            || justify.level >= level
        {
            return Err(invalid("justify qc does not certify the parent block"));
        }
        validate_qc(&justify, &self.epochs.read(), self.deps.ac.as_ref())?;

        if !self.chain_store.contains(&justify.block_id) {
            let proposer = proposal.proposer_idx;
            info!(
                height,
                level,
                parent = hex::encode(&justify.block_id[..8]),
                "Parent block unknown, fetching"
            );
            self.pending_proposal = Some(proposal);
            return Ok(self.fetch_request(proposer, justify.block_id, justify.height));
        }

        let mut actions = self.process_certificates(&justify)?;

        let round = self.round.snapshot();
        if height != round.height || level < round.level {
            return Err(SmrError::Stale {
                height,
                level,
                current_height: round.height,
                current_level: round.level,
            });
        }
        if level > round.level {
            debug!(height, from = round.level, to = level, "Catching up to proposal level");
            self.round.set(RoundState { level, ..round });
            actions.push(SmrAction::ScheduleTimer(TimerEvent {
                height,
                level,
                epoch_id: epoch.epoch_id,
                state: ConsensusState::Propose,
                duration: epoch.timeouts.timeout_for(level, justify.level),
            }));
        }

        self.pool.insert_proposal(&proposal)?;
        let block_hash = block.hash();
        if !self.chain_store.contains(&block_hash) {
            self.deps.verifier.verify_block(block, VerifyMode::Consensus)?;
            self.chain_store.insert_block(block.clone(), level)?;
            self.deps.wal.write_proposal(&proposal)?;
        }

        let voted = self.cast_vote(&proposal, &epoch, &mut actions);
        // a QC formed before its block arrived
        let applied = self.retry_pending_qc(Some(&block_hash), &mut actions);
        match voted {
            Err(e) if applied => {
                debug!(height, level, error = %e, "no vote, pending qc applied");
                Ok(actions)
            }
            other => other.map(|()| actions),
        }
    }

    fn cast_vote(
        &mut self,
        proposal: &ProposalData,
        epoch: &Epoch,
        actions: &mut Vec<SmrAction>,
    ) -> SmrResult<()> {
        let (height, level) = (proposal.height, proposal.level);
        let block = &proposal.block;
        let extends_lock = self
            .chain_store
            .extends(&block.header.pre_block_hash, &self.safety.locked_qc().block_id);
        self.safety
            .check_vote(height, level, &proposal.justify_qc, extends_lock)?;

        let Some(local) = epoch.local_index else {
            return Ok(());
        };
        let mut vote = Vote::for_block(height, level, epoch.epoch_id, block.hash(), local);
        self.deps.wal.write_vote(&vote)?;
        vote.sign(self.deps.signer.as_ref())?;
        self.safety.record_vote(level);
        self.round.set_state(ConsensusState::Vote);

        let next = epoch.proposer_for(height + 1, level + 1);
        debug!(
            height,
            level,
            block_hash = hex::encode(&vote.block_id[..8]),
            next_proposer = next,
            "Voting for block"
        );
        if next == local {
            self.handle_local_vote(vote, actions);
        } else {
            actions.push(SmrAction::SendTo {
                to: next,
                payload: ConsensusPayload::Vote(vote),
            });
        }
        Ok(())
    }

    /// Apply the parked QC if its block is now known. With `only`, the QC
    /// is retried only when it certifies that block. Returns whether it
    /// was applied.
    pub(crate) fn retry_pending_qc(
        &mut self,
        only: Option<&Hash>,
        actions: &mut Vec<SmrAction>,
    ) -> bool {
        let Some(qc) = self.pending_qc.take() else {
            return false;
        };
        if only.is_some_and(|hash| *hash != qc.block_id) {
            self.pending_qc = Some(qc);
            return false;
        }
        match self.process_certificates(&qc) {
            Ok(more) => {
                actions.extend(more);
                true
            }
            Err(SmrError::ChainStore(ChainStoreError::UnknownBlock { .. })) => {
                self.pending_qc = Some(qc);
                false
            }
            Err(e) => {
                debug!(height = qc.height, level = qc.level, error = %e, "pending qc dropped");
                false
            }
        }
    }

    /// Verify a vote, add it to the pool and process any QC it completes.
    pub fn process_vote(&mut self, vote: Vote) -> SmrResult<Vec<SmrAction>> {
        let epoch = self.epoch();
        if vote.epoch_id != epoch.epoch_id {
            return Err(SmrError::WrongEpoch {
                got: vote.epoch_id,
                current: epoch.epoch_id,
            });
        }
        if vote.height <= self.chain_store.get_commit_height() {
            let round = self.round.snapshot();
            return Err(SmrError::Stale {
                height: vote.height,
                level: vote.level,
                current_height: round.height,
                current_level: round.level,
            });
        }
        verify_vote(&vote, &epoch, self.deps.ac.as_ref())?;
        trace!(%vote, "Accepted vote");

        let author = vote.author_idx;
        let Some(qc) = self.pool.add_vote(vote, epoch.quorum)? else {
            return Ok(Vec::new());
        };
        info!(%qc, "Formed quorum certificate");

        match self.process_certificates(&qc) {
            Err(SmrError::ChainStore(ChainStoreError::UnknownBlock { .. })) => {
                let (block_id, height) = (qc.block_id, qc.height);
                self.pending_qc = Some(qc);
                Ok(self.fetch_request(author, block_id, height))
            }
            other => other,
        }
    }

    fn handle_local_vote(&mut self, vote: Vote, actions: &mut Vec<SmrAction>) {
        let (height, level) = (vote.height, vote.level);
        match self.process_vote(vote) {
            Ok(more) => actions.extend(more),
            Err(e) => debug!(height, level, error = %e, "local vote not applied"),
        }
    }

    /// Apply a QC: record it, update the lock, commit under the three-chain
    /// rule, and advance (height, level). Never moves backwards.
    pub fn process_certificates(&mut self, qc: &QuorumCert) -> SmrResult<Vec<SmrAction>> {
        let round = self.round.snapshot();

        if qc.new_view {
            if qc.level >= round.level {
                info!(height = round.height, level = qc.level, "New-view QC, advancing level");
                return Ok(self.enter_level(round.height, qc.level + 1));
            }
            return Ok(Vec::new());
        }

        if !self.chain_store.contains(&qc.block_id)
            && qc.height <= self.chain_store.get_commit_height()
        {
            trace!(height = qc.height, level = qc.level, "ignoring qc below commit height");
            return Ok(Vec::new());
        }

        self.chain_store.insert_qc(qc.clone())?;
        if let Some(parent_qc) = self.chain_store.parent_qc(&qc.block_id).cloned() {
            self.safety.update_lock(&parent_qc);
        }

        if let Some(hash) = self.chain_store.committable_block(qc) {
            self.round.set_state(ConsensusState::Commit);
            let committed = self.chain_store.commit_block(&hash)?;
            debug!(
                blocks = committed.len(),
                commit_height = self.chain_store.get_commit_height(),
                "Three-chain commit"
            );
        }

        let next_height = self.chain_store.get_current_qc().height + 1;
        let next_level = round.level.max(qc.level + 1);
        if next_height != round.height || next_level != round.level {
            return Ok(self.enter_level(next_height, next_level));
        }
        self.round.set_state(round.state);
        Ok(Vec::new())
    }

    /// Handle a fired round timer: broadcast a new-view vote for the
    /// current level and re-arm the timer. Stale timers are ignored.
    pub fn process_local_timeout(&mut self, event: TimerEvent) -> SmrResult<Vec<SmrAction>> {
        let round = self.round.snapshot();
        if event.height != round.height
            || event.level != round.level
            || event.epoch_id != round.epoch_id
        {
            debug!(
                height = event.height,
                level = event.level,
                epoch = event.epoch_id,
                %round,
                "Ignoring stale timer"
            );
            return Ok(Vec::new());
        }

        let epoch = self.epoch();
        let Some(local) = epoch.local_index else {
            return Ok(Vec::new());
        };

        warn!(height = round.height, level = round.level, "Round timed out, sending new-view vote");
        let mut vote = Vote::new_view(round.height, round.level, epoch.epoch_id, local);
        self.deps.wal.write_vote(&vote)?;
        vote.sign(self.deps.signer.as_ref())?;
        self.safety.record_vote(round.level);
        self.round.set_state(ConsensusState::NewView);

        let qc_level = self.chain_store.get_current_qc().level;
        let mut actions = vec![
            SmrAction::Broadcast(ConsensusPayload::Vote(vote.clone())),
            SmrAction::ScheduleTimer(TimerEvent {
                state: ConsensusState::NewView,
                duration: epoch.timeouts.timeout_for(round.level, qc_level),
                ..event
            }),
        ];
        self.handle_local_vote(vote, &mut actions);
        Ok(actions)
    }

    /// Housekeeping after the committer made `block` durable: prune the
    /// pool, chain store and WAL, and switch epoch at the boundary.
    pub fn process_block_committed(&mut self, block: &Block) -> SmrResult<Vec<SmrAction>> {
        let height = block.height();
        self.pool.prune(self.chain_store.get_commit_height().min(height));
        self.chain_store.prune();
        self.deps.wal.write_committed(height, block.hash())?;
        self.deps.wal.prune(height)?;

        let epoch = self.epoch();
        if height < epoch.next_switch_height {
            return Ok(Vec::new());
        }
        let contract = self.deps.governance.governance_at(height + 1)?;
        if contract.epoch_id == epoch.epoch_id {
            return Ok(Vec::new());
        }
        let next = Epoch::new(
            contract,
            &self.deps.node_id,
            self.config.selection,
            &self.config.timeouts,
        )?;
        self.epochs.write().switch(next);
        let round = self.round.snapshot();
        Ok(self.enter_level(round.height, round.level))
    }

    /// Build a fetch request for `count` blocks ending at `block_id`.
    pub(crate) fn fetch_request(
        &mut self,
        to: ValidatorIndex,
        block_id: Hash,
        height: u64,
    ) -> Vec<SmrAction> {
        let Some(local) = self.epoch().local_index else {
            return Vec::new();
        };
        let missing = height.saturating_sub(self.chain_store.get_commit_height()).max(1);
        let num_blocks = missing.min(u64::from(self.config.fetch_batch_size.max(1))) as u32;
        self.next_req_id += 1;
        vec![SmrAction::SendTo {
            to,
            payload: ConsensusPayload::BlockFetch(BlockFetchMsg {
                block_id,
                height,
                num_blocks,
                req_id: self.next_req_id,
                author_idx: local,
            }),
        }]
    }
}
