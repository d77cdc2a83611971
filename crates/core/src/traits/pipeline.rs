//! Block verification and commit hooks owned by the core engine.

use hotchain_types::Block;
use thiserror::Error;

use super::StorageError;

/// Where a block under verification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// A fresh proposal being voted on
    Consensus,
    /// A certified block received while catching up
    Sync,
}

/// Errors from the block pipeline.
#[derive(Error, Debug, Clone)]
pub enum BlockError {
    /// The block failed verification.
    #[error("invalid block at height {height}: {reason}")]
    Invalid {
        /// Height of the rejected block
        height: u64,
        /// Why it was rejected
        reason: String,
    },

    /// Persisting the block failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for block pipeline operations.
pub type BlockResult<T> = Result<T, BlockError>;

/// Executes or re-checks a block before consensus votes for it.
pub trait BlockVerifier: Send + Sync {
    /// Verify `block`.
    fn verify_block(&self, block: &Block, mode: VerifyMode) -> BlockResult<()>;
}

/// Makes a certified block durable.
pub trait BlockCommitter: Send + Sync {
    /// Commit `block`; its additional data carries the certifying QC.
    fn add_block(&self, block: &Block) -> BlockResult<()>;
}
