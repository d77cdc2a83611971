//! Block verification by re-execution.

use std::sync::Arc;

use hotchain_core::{BlockError, BlockResult, BlockVerifier, VerifyMode};
use hotchain_types::codec::compute_tx_root;
use hotchain_types::Block;
use tracing::{trace, warn};

use crate::executor::BlockExecutor;

/// Checks block integrity, then executes it on the snapshot chain.
pub struct ExecutingVerifier {
    chain_id: String,
    executor: Arc<BlockExecutor>,
}

impl ExecutingVerifier {
    /// Create a verifier for `chain_id`.
    pub fn new(chain_id: impl Into<String>, executor: Arc<BlockExecutor>) -> Self {
        Self {
            chain_id: chain_id.into(),
            executor,
        }
    }

    fn invalid(block: &Block, reason: impl Into<String>) -> BlockError {
        BlockError::Invalid {
            height: block.height(),
            reason: reason.into(),
        }
    }
}

impl BlockVerifier for ExecutingVerifier {
    fn verify_block(&self, block: &Block, mode: VerifyMode) -> BlockResult<()> {
        if block.header.chain_id != self.chain_id {
            return Err(Self::invalid(
                block,
                format!("chain id {} != {}", block.header.chain_id, self.chain_id),
            ));
        }
        if block.compute_hash() != block.hash() {
            return Err(Self::invalid(block, "block hash mismatch"));
        }
        if compute_tx_root(&block.txs) != block.header.tx_root {
            return Err(Self::invalid(block, "tx root mismatch"));
        }
        if block.dag.vertexes.len() != block.txs.len() {
            return Err(Self::invalid(block, "dag does not cover every transaction"));
        }

        self.executor.execute_block(block).map_err(|e| {
            warn!(height = block.height(), ?mode, "Execution check failed: {}", e);
            Self::invalid(block, e.to_string())
        })?;
        trace!(height = block.height(), ?mode, "Block verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::transfer_tx;
    use hotchain_core::MemoryBlockchainStore;
    use hotchain_snapshot::{ManagerConfig, SnapshotManager};
    use hotchain_types::{BlockHeader, Member};

    fn executor(genesis: &Block) -> Arc<BlockExecutor> {
        let store = Arc::new(MemoryBlockchainStore::with_genesis(genesis).unwrap());
        let snapshots = Arc::new(SnapshotManager::new(store.clone(), ManagerConfig::default()));
        Arc::new(BlockExecutor::new(store, snapshots))
    }

    fn proposed(genesis: &Block) -> Block {
        executor(genesis)
            .build_block(
                BlockHeader {
                    chain_id: "verify".into(),
                    block_height: 1,
                    pre_block_hash: genesis.hash(),
                    block_timestamp: 1,
                    proposer: Some(Member::new("org1", vec![1])),
                    ..Default::default()
                },
                vec![
                    transfer_tx("a", "verify", "x", "y", 5),
                    transfer_tx("b", "verify", "y", "z", 5),
                ],
            )
            .unwrap()
    }

    #[test]
    fn test_accepts_honest_block() {
        let genesis = Block::genesis("verify");
        let verifier = ExecutingVerifier::new("verify", executor(&genesis));
        verifier
            .verify_block(&proposed(&genesis), VerifyMode::Consensus)
            .unwrap();
    }

    #[test]
    fn test_rejects_foreign_chain() {
        let genesis = Block::genesis("verify");
        let verifier = ExecutingVerifier::new("other", executor(&genesis));
        let err = verifier
            .verify_block(&proposed(&genesis), VerifyMode::Sync)
            .unwrap_err();
        assert!(matches!(err, BlockError::Invalid { height: 1, .. }));
    }

    #[test]
    fn test_rejects_tampered_results() {
        let genesis = Block::genesis("verify");
        let verifier = ExecutingVerifier::new("verify", executor(&genesis));
        let mut block = proposed(&genesis);
        block.txs[0].method = "mint".into();
        assert!(verifier.verify_block(&block, VerifyMode::Consensus).is_err());
    }
}
