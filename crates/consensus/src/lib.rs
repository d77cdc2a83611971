//! # Hotchain Consensus
//!
//! Chained-HotStuff BFT consensus engine.
//!
//! Every block is proposed at a (height, level). Heights count blocks;
//! levels count consensus rounds and also advance when a round times out
//! without a block. A quorum of block votes forms a QC that the next
//! proposal carries, so each proposal drives the previous block one phase
//! further.
//!
//! ## Consensus Flow
//!
//! ```text
//! Height h, level l:
//!
//! ┌──────────────┐
//! │   PROPOSE    │  proposer = elect(epoch, h, l)
//! │              │  broadcast Proposal{h, l, block, justify = highest QC}
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │     VOTE     │  IF justify certifies parent AND safe_to_vote:
//! │              │      send Vote{h, l, hash(block)} to elect(epoch, h+1, l+1)
//! └──────┬───────┘
//!        │   timeout
//!        ├──────────────► NEWVIEW: broadcast Vote{h, l, new_view}
//!        │                quorum of new-view votes -> level l+1, same height
//!        ▼
//! ┌──────────────┐
//! │    COMMIT    │  QC(B) with B.parent.level + 1 == B.level and
//! │              │  B.grandparent.level + 1 == B.parent.level
//! │              │      commit B.grandparent and its ancestors
//! └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use hotchain_consensus::{ChainedBftEngine, ConsensusDeps, EngineConfig};
//!
//! let engine = ChainedBftEngine::new(deps, EngineConfig::with_wal_dir("./data/wal"))?;
//! engine.start().await?;
//! println!("{}", engine.round_state());
//! engine.stop().await;
//! ```
//!
//! ## Safety Guarantees
//!
//! **Agreement**: No two honest validators commit different blocks at the same height.
//!
//! **Locking**: A validator never votes for a block that conflicts with its
//! locked QC unless the proposal carries a higher QC.
//!
//! **Liveness**: The chain makes progress after GST as long as a quorum of
//! validators is honest and online.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod chain_store;
pub mod dispatch;
pub mod engine;
pub mod governance;
pub mod pool;
pub mod proposer;
pub mod qc;
pub mod smr;
pub mod sync;
pub mod timer;
pub mod types;
pub mod verifier;
pub mod wal;

pub use chain_store::{ChainEntry, ChainStore, ChainStoreError, ChainStoreResult};
pub use dispatch::{MsgDispatcher, RawMessage};
pub use engine::{ChainedBftEngine, ConsensusDeps, ConsensusError, ConsensusResult, EngineConfig};
pub use governance::{
    quorum_for, Epoch, EpochView, GovernanceContract, GovernanceError, GovernanceProvider,
    GovernanceResult, StaticGovernance, ValidatorInfo,
};
pub use pool::{LevelVoteSet, MsgPool, PoolError, PoolResult};
pub use proposer::ProposerSelection;
pub use qc::{count_votes, validate_qc, verify_proposal, verify_vote, QcError, QcResult, VoteCount};
pub use smr::{ChainedBftSmr, SafetyRules, SmrAction, SmrConfig, SmrDeps, SmrError, SmrResult};
pub use timer::{TimeoutConfig, TimerEvent, TimerService};
pub use types::{
    domains, BlockFetchMsg, BlockFetchRespMsg, BlockPair, ConsensusMsg, ConsensusPayload,
    ConsensusState, FetchStatus, MessageType, ProposalData, QuorumCert, RoundState,
    RoundStateCell, ValidatorIndex, Vote,
};
pub use verifier::BlockSignatureVerifier;
pub use wal::{ConsensusWal, WalConfig, WalEntry, WalEntryType, WalError, WalRecord, WalResult};
