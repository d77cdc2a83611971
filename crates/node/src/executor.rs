//! # Block Executor
//!
//! Runs block transactions against execution snapshots.
//!
//! The devnet VM knows a single `bank` contract with a `transfer` method.
//! Proposers execute in parallel on rayon workers, retrying each transfer
//! whose reads were overtaken by a concurrent write. Everyone else replays
//! the block sequentially in its recorded order and checks that the DAG
//! and read/write-set root match the header.

use std::collections::HashMap;
use std::sync::Arc;

use hotchain_core::BlockchainStore;
use hotchain_snapshot::{
    ApplyOutcome, SimContext, Snapshot, SnapshotError, SnapshotManager, SnapshotResult,
    SpecialTxType, TxSimContext,
};
use hotchain_types::codec::{compute_dag_hash, compute_rw_set_root};
use hotchain_types::{
    Block, BlockHeader, ContractResult, Dag, Hash, Transaction, TxRWSet, TxResult, TxStatusCode,
    TypesError,
};
use parking_lot::RwLock;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, trace};

/// Contract served by the devnet VM.
pub const BANK_CONTRACT: &str = "bank";

/// Balance of an account that was never written.
pub const INITIAL_BALANCE: u64 = 1_000;

/// Errors raised while executing or re-checking a block.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Neither the recent-block cache nor the store knows the parent
    #[error("parent {parent} of block {height} is unknown")]
    UnknownParent {
        /// Height of the child
        height: u64,
        /// Hex prefix of the missing parent hash
        parent: String,
    },

    /// Re-execution disagrees with the header
    #[error("block {height}: {what} mismatch")]
    Mismatch {
        /// Height of the block
        height: u64,
        /// Which commitment differs
        what: &'static str,
    },

    /// The snapshot was sealed under a running execution
    #[error("snapshot for block {height} was sealed during execution")]
    Sealed {
        /// Height of the block
        height: u64,
    },

    /// Snapshot read failure
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Encoding failure while hashing commitments
    #[error(transparent)]
    Types(#[from] TypesError),
}

/// Result alias for block execution.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// What a block's execution produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// Transactions in apply order, results attached
    pub txs: Vec<Transaction>,
    /// Read/write sets in apply order
    pub rwsets: Vec<TxRWSet>,
    /// Dependency graph over `txs`
    pub dag: Dag,
}

/// A `bank.transfer` transaction.
pub fn transfer_tx(
    tx_id: impl Into<String>,
    chain_id: impl Into<String>,
    from: &str,
    to: &str,
    amount: u64,
) -> Transaction {
    Transaction {
        chain_id: chain_id.into(),
        parameters: vec![
            ("from".to_string(), from.as_bytes().to_vec()),
            ("to".to_string(), to.as_bytes().to_vec()),
            ("amount".to_string(), amount.to_be_bytes().to_vec()),
        ],
        ..Transaction::invoke(tx_id, BANK_CONTRACT, "transfer")
    }
}

/// Decode a stored balance.
pub fn decode_balance(value: Option<&[u8]>) -> Option<u64> {
    match value {
        None => Some(INITIAL_BALANCE),
        Some(bytes) => bytes.try_into().ok().map(u64::from_be_bytes),
    }
}

fn param<'a>(tx: &'a Transaction, name: &str) -> Option<&'a [u8]> {
    tx.parameters
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_slice())
}

fn outcome(code: TxStatusCode, message: &str) -> TxResult {
    TxResult {
        code,
        contract_result: ContractResult {
            code: u32::from(code != TxStatusCode::Success),
            message: message.to_string(),
            gas_used: 1,
            ..Default::default()
        },
        rw_set_hash: Vec::new(),
    }
}

/// Simulate one transfer. The flag is whether the VM run succeeded.
fn run_transfer(ctx: &mut SimContext, snapshot: &Snapshot) -> SnapshotResult<(TxResult, bool)> {
    let tx = ctx.tx().clone();
    if tx.contract_name != BANK_CONTRACT || tx.method != "transfer" {
        return Ok((outcome(TxStatusCode::InternalError, "unknown method"), false));
    }
    let (Some(from), Some(to), Some(amount)) = (
        param(&tx, "from"),
        param(&tx, "to"),
        param(&tx, "amount").and_then(|a| a.try_into().ok().map(u64::from_be_bytes)),
    ) else {
        return Ok((outcome(TxStatusCode::InternalError, "malformed transfer"), false));
    };

    let from_value = ctx.get(snapshot, BANK_CONTRACT, from)?;
    let Some(from_balance) = decode_balance(from_value.as_deref()) else {
        return Ok((outcome(TxStatusCode::InternalError, "corrupt balance"), false));
    };
    if from_balance < amount {
        return Ok((outcome(TxStatusCode::ContractFail, "insufficient balance"), false));
    }
    if from == to {
        return Ok((outcome(TxStatusCode::Success, "ok"), true));
    }

    let to_value = ctx.get(snapshot, BANK_CONTRACT, to)?;
    let Some(to_balance) = decode_balance(to_value.as_deref()) else {
        return Ok((outcome(TxStatusCode::InternalError, "corrupt balance"), false));
    };
    let Some(credited) = to_balance.checked_add(amount) else {
        return Ok((outcome(TxStatusCode::ContractFail, "balance overflow"), false));
    };

    ctx.put(BANK_CONTRACT, from, (from_balance - amount).to_be_bytes().to_vec());
    ctx.put(BANK_CONTRACT, to, credited.to_be_bytes().to_vec());
    Ok((outcome(TxStatusCode::Success, "ok"), true))
}

/// Execute `txs` concurrently, retrying conflicting applies.
///
/// The apply order, not the input order, becomes the block order.
pub fn execute_parallel(snapshot: &Snapshot, txs: &[Transaction]) -> ExecutionResult<ExecutionOutput> {
    let height = snapshot.block_height();
    txs.par_iter().try_for_each(|tx| -> ExecutionResult<()> {
        let mut attempts = 0u32;
        loop {
            let mut ctx = SimContext::begin(tx.clone(), snapshot);
            let (result, ok) = run_transfer(&mut ctx, snapshot)?;
            ctx.set_result(result);
            match snapshot.apply_tx_sim_context(&ctx, SpecialTxType::None, ok, false) {
                ApplyOutcome::Applied { .. } => {
                    if attempts > 0 {
                        trace!(tx_id = %tx.tx_id, attempts, "Applied after retries");
                    }
                    return Ok(());
                }
                ApplyOutcome::Conflict { .. } => attempts += 1,
                ApplyOutcome::Sealed { .. } => return Err(ExecutionError::Sealed { height }),
            }
        }
    })?;
    Ok(finish(snapshot))
}

/// Execute `txs` one after another, in order.
pub fn execute_sequential(
    snapshot: &Snapshot,
    txs: &[Transaction],
) -> ExecutionResult<ExecutionOutput> {
    let height = snapshot.block_height();
    for tx in txs {
        let mut ctx = SimContext::begin(tx.clone(), snapshot);
        let (result, ok) = run_transfer(&mut ctx, snapshot)?;
        ctx.set_result(result);
        if !snapshot
            .apply_tx_sim_context(&ctx, SpecialTxType::None, ok, false)
            .is_applied()
        {
            return Err(ExecutionError::Sealed { height });
        }
    }
    Ok(finish(snapshot))
}

fn finish(snapshot: &Snapshot) -> ExecutionOutput {
    snapshot.seal();
    let mut results = snapshot.tx_result_map();
    let txs = snapshot
        .tx_table()
        .into_iter()
        .map(|mut tx| {
            tx.result = results.remove(&tx.tx_id);
            tx
        })
        .collect();
    ExecutionOutput {
        txs,
        rwsets: snapshot.tx_rwset_table(),
        dag: snapshot.build_dag(false),
    }
}

/// Builds and re-checks blocks on top of the snapshot chain.
///
/// Blocks that passed execution but are not committed yet are kept so
/// that their children can find them.
pub struct BlockExecutor {
    store: Arc<dyn BlockchainStore>,
    snapshots: Arc<SnapshotManager>,
    pending: RwLock<HashMap<Hash, Block>>,
}

impl BlockExecutor {
    /// Create an executor over `store`.
    pub fn new(store: Arc<dyn BlockchainStore>, snapshots: Arc<SnapshotManager>) -> Self {
        Self {
            store,
            snapshots,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// The snapshot manager.
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Executed, uncommitted blocks.
    pub fn pending_len(&self) -> usize {
        self.pending.read().len()
    }

    fn parent_of(&self, block: &Block) -> ExecutionResult<Block> {
        let parent_hash = block.header.pre_block_hash;
        if let Some(parent) = self.pending.read().get(&parent_hash) {
            return Ok(parent.clone());
        }
        self.store
            .get_block_by_hash(&parent_hash)
            .map_err(SnapshotError::from)?
            .ok_or_else(|| ExecutionError::UnknownParent {
                height: block.height(),
                parent: hex::encode(&parent_hash[..8]),
            })
    }

    /// Execute `txs` in parallel and assemble the block.
    pub fn build_block(
        &self,
        mut header: BlockHeader,
        txs: Vec<Transaction>,
    ) -> ExecutionResult<Block> {
        let template = Block::new(header.clone(), Vec::new());
        let parent = self.parent_of(&template)?;
        let snapshot = self.snapshots.new_snapshot(&parent, &template);
        let out = execute_parallel(&snapshot, &txs)?;

        header.dag_hash = compute_dag_hash(&out.dag)?;
        header.rw_set_root = compute_rw_set_root(&out.rwsets)?;
        let mut block = Block::new(header, out.txs);
        block.dag = out.dag;

        self.pending.write().insert(block.hash(), block.clone());
        debug!(
            height = block.height(),
            txs = block.txs.len(),
            block_hash = hex::encode(&block.hash()[..8]),
            "Built block"
        );
        Ok(block)
    }

    /// Snapshot holding `block`'s execution, re-executing when needed.
    ///
    /// A sealed snapshot already stored under the block's fingerprint is
    /// reused if it reproduces the header commitments.
    pub fn execute_block(&self, block: &Block) -> ExecutionResult<Arc<Snapshot>> {
        let height = block.height();
        if compute_dag_hash(&block.dag)? != block.header.dag_hash {
            return Err(ExecutionError::Mismatch {
                height,
                what: "dag_hash",
            });
        }

        if let Some(existing) = self.snapshots.get_snapshot(block) {
            if existing.is_sealed()
                && existing.snapshot_size() == block.txs.len()
                && existing.build_dag(false) == block.dag
                && compute_rw_set_root(&existing.tx_rwset_table())? == block.header.rw_set_root
            {
                self.pending.write().insert(block.hash(), block.clone());
                return Ok(existing);
            }
        }

        let parent = self.parent_of(block)?;
        let snapshot = self.snapshots.new_snapshot(&parent, block);
        let out = execute_sequential(&snapshot, &block.txs)?;
        if out.dag != block.dag {
            return Err(ExecutionError::Mismatch { height, what: "dag" });
        }
        if compute_rw_set_root(&out.rwsets)? != block.header.rw_set_root {
            return Err(ExecutionError::Mismatch {
                height,
                what: "rw_set_root",
            });
        }

        self.pending.write().insert(block.hash(), block.clone());
        debug!(height, txs = block.txs.len(), "Re-executed block");
        Ok(snapshot)
    }

    /// Retire the committed block's snapshot and forget pending blocks at
    /// or below its height.
    pub fn block_committed(&self, block: &Block) -> ExecutionResult<()> {
        self.snapshots.notify_block_committed(block)?;
        let height = block.height();
        self.pending.write().retain(|_, b| b.height() > height);
        Ok(())
    }
}
