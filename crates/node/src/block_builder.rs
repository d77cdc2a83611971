//! Block builder answering consensus `ProposeState` requests.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hotchain_core::{BusMessage, MsgBus, ProposeState, Subscriber};
use hotchain_types::{Block, BlockHeader, Member, Transaction};
use rand::Rng;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::executor::{transfer_tx, BlockExecutor, ExecutionResult};

/// Accounts the synthetic workload moves balance between.
pub const DEVNET_ACCOUNTS: usize = 8;

/// Builds blocks of synthetic bank transfers for the local proposer.
///
/// Requests arrive on the publisher's thread; execution runs on the tokio
/// blocking pool and the result is published as `ProposedBlock`.
pub struct BlockBuilder {
    job: Arc<BuildJob>,
}

struct BuildJob {
    chain_id: String,
    proposer: Member,
    txs_per_block: usize,
    executor: Arc<BlockExecutor>,
    bus: Arc<MsgBus>,
}

impl BlockBuilder {
    /// Create a builder publishing to `bus`.
    pub fn new(
        chain_id: impl Into<String>,
        proposer: Member,
        txs_per_block: usize,
        executor: Arc<BlockExecutor>,
        bus: Arc<MsgBus>,
    ) -> Self {
        Self {
            job: Arc::new(BuildJob {
                chain_id: chain_id.into(),
                proposer,
                txs_per_block,
                executor,
                bus,
            }),
        }
    }

    /// Build the block requested by `state` on the calling thread.
    pub fn build(&self, state: &ProposeState) -> ExecutionResult<Block> {
        self.job.build(state)
    }
}

impl BuildJob {
    fn synthetic_txs(&self, state: &ProposeState) -> Vec<Transaction> {
        let mut rng = rand::thread_rng();
        (0..self.txs_per_block)
            .map(|i| {
                let from = rng.gen_range(0..DEVNET_ACCOUNTS);
                let to = rng.gen_range(0..DEVNET_ACCOUNTS);
                let nonce: u32 = rng.gen();
                let mut tx = transfer_tx(
                    format!("{}-{}-{}-{:08x}", state.height, state.level, i, nonce),
                    self.chain_id.clone(),
                    &format!("acct{from}"),
                    &format!("acct{to}"),
                    rng.gen_range(1..=50),
                );
                tx.sender = Some(self.proposer.clone());
                tx
            })
            .collect()
    }

    fn build(&self, state: &ProposeState) -> ExecutionResult<Block> {
        let header = BlockHeader {
            chain_id: self.chain_id.clone(),
            block_height: state.height,
            pre_block_hash: state.pre_block_hash,
            block_timestamp: unix_now(),
            proposer: Some(self.proposer.clone()),
            ..Default::default()
        };
        self.executor
            .build_block(header, self.synthetic_txs(state))
    }

    fn run(&self, state: &ProposeState) {
        match self.build(state) {
            Ok(block) => {
                debug!(
                    height = state.height,
                    level = state.level,
                    txs = block.txs.len(),
                    "Publishing proposed block"
                );
                self.bus.publish(BusMessage::ProposedBlock(block));
            }
            Err(e) => warn!(height = state.height, level = state.level, "Block build failed: {}", e),
        }
    }
}

impl Subscriber for BlockBuilder {
    fn on_message(&self, msg: &BusMessage) {
        let BusMessage::ProposeState(state) = msg else {
            return;
        };
        let state = state.clone();
        let job = self.job.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || job.run(&state));
            }
            // no runtime: build inline
            Err(_) => job.run(&state),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotchain_core::{MemoryBlockchainStore, Topic};
    use hotchain_snapshot::{ManagerConfig, SnapshotManager};
    use hotchain_types::CURRENT_BLOCK_VERSION;
    use parking_lot::Mutex;
    use std::thread::{self, ThreadId};
    use std::time::Duration;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(Block, ThreadId)>>);

    impl Subscriber for Capture {
        fn on_message(&self, msg: &BusMessage) {
            if let BusMessage::ProposedBlock(block) = msg {
                self.0.lock().push((block.clone(), thread::current().id()));
            }
        }
    }

    fn builder_with_capture(store: Arc<MemoryBlockchainStore>, txs: usize) -> (BlockBuilder, Arc<Capture>) {
        let snapshots = Arc::new(SnapshotManager::new(store.clone(), ManagerConfig::default()));
        let executor = Arc::new(BlockExecutor::new(store, snapshots));
        let bus = Arc::new(MsgBus::new());
        let capture = Arc::new(Capture::default());
        bus.register(Topic::ProposedBlock, capture.clone());
        let builder = BlockBuilder::new("builder", Member::new("org1", vec![7]), txs, executor, bus);
        (builder, capture)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_propose_state_yields_executed_block() {
        let genesis = Block::genesis("builder");
        let store = Arc::new(MemoryBlockchainStore::with_genesis(&genesis).unwrap());
        let (builder, capture) = builder_with_capture(store, 6);

        builder.on_message(&BusMessage::ProposeState(ProposeState {
            height: 1,
            level: 1,
            pre_block_hash: genesis.hash(),
        }));

        for _ in 0..200 {
            if !capture.0.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let blocks = capture.0.lock();
        assert_eq!(blocks.len(), 1);
        let (block, built_on) = &blocks[0];
        assert_ne!(*built_on, thread::current().id());
        assert_eq!(block.height(), 1);
        assert_eq!(block.header.block_version, CURRENT_BLOCK_VERSION);
        assert_eq!(block.txs.len(), 6);
        assert_eq!(block.dag.vertexes.len(), 6);
        assert!(block.txs.iter().all(|tx| tx.result.is_some()));
    }

    #[test]
    fn test_unknown_parent_publishes_nothing() {
        let (builder, capture) = builder_with_capture(Arc::new(MemoryBlockchainStore::new()), 2);
        builder.on_message(&BusMessage::ProposeState(ProposeState {
            height: 4,
            level: 9,
            pre_block_hash: [3u8; 32],
        }));
        assert!(capture.0.lock().is_empty());
        assert!(builder
            .build(&ProposeState {
                height: 4,
                level: 9,
                pre_block_hash: [3u8; 32],
            })
            .is_err());
    }
}
