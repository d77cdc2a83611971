//! Ledger committer: persists certified blocks and announces them.

use std::sync::Arc;

use hotchain_core::{
    BlockCommitter, BlockError, BlockResult, BlockchainStore, BusMessage, LedgerCache, MsgBus,
};
use hotchain_types::{Block, BlockInfo};
use tracing::debug;

use crate::executor::BlockExecutor;

/// Writes committed blocks with their read/write sets.
pub struct LedgerCommitter {
    store: Arc<dyn BlockchainStore>,
    ledger: Arc<dyn LedgerCache>,
    executor: Arc<BlockExecutor>,
    bus: Arc<MsgBus>,
}

impl LedgerCommitter {
    /// Create a committer.
    pub fn new(
        store: Arc<dyn BlockchainStore>,
        ledger: Arc<dyn LedgerCache>,
        executor: Arc<BlockExecutor>,
        bus: Arc<MsgBus>,
    ) -> Self {
        Self {
            store,
            ledger,
            executor,
            bus,
        }
    }
}

impl BlockCommitter for LedgerCommitter {
    fn add_block(&self, block: &Block) -> BlockResult<()> {
        let snapshot = self
            .executor
            .execute_block(block)
            .map_err(|e| BlockError::Invalid {
                height: block.height(),
                reason: e.to_string(),
            })?;
        let rwsets = snapshot.tx_rwset_table();

        self.store.put_block(block, &rwsets)?;
        self.ledger.set_last_committed_block(block.clone());
        self.executor
            .block_committed(block)
            .map_err(|e| BlockError::Invalid {
                height: block.height(),
                reason: e.to_string(),
            })?;

        debug!(
            height = block.height(),
            rwsets = rwsets.len(),
            "Persisted block state"
        );
        self.bus.publish(BusMessage::BlockInfo(Arc::new(BlockInfo {
            block: block.clone(),
            rwsets,
        })));
        Ok(())
    }
}
