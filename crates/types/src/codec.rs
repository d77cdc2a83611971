//! Parallel batch (de)serialization of block transactions.
//!
//! Transactions are split into fixed batches of [`TX_BATCH_SIZE`]; each batch
//! is handled on a rayon worker and the results are joined back in order
//! before returning.

use hotchain_crypto::{Hash, Hasher, ZERO_HASH};
use rayon::prelude::*;

use crate::{Block, Dag, Result, Transaction, TxRWSet, TypesError};

/// Number of transactions handled by one worker.
pub const TX_BATCH_SIZE: usize = 1000;

/// Serialize each transaction with bincode, in parallel batches.
pub fn marshal_txs(txs: &[Transaction]) -> Result<Vec<Vec<u8>>> {
    let batches: Vec<Result<Vec<Vec<u8>>>> = txs
        .par_chunks(TX_BATCH_SIZE)
        .enumerate()
        .map(|(batch, chunk)| {
            chunk
                .iter()
                .map(|tx| {
                    bincode::serialize(tx).map_err(|e| TypesError::Batch {
                        batch,
                        message: e.to_string(),
                    })
                })
                .collect()
        })
        .collect();

    let mut out = Vec::with_capacity(txs.len());
    for batch in batches {
        out.extend(batch?);
    }
    Ok(out)
}

/// Inverse of [`marshal_txs`].
pub fn unmarshal_txs(raw: &[Vec<u8>]) -> Result<Vec<Transaction>> {
    let batches: Vec<Result<Vec<Transaction>>> = raw
        .par_chunks(TX_BATCH_SIZE)
        .enumerate()
        .map(|(batch, chunk)| {
            chunk
                .iter()
                .map(|bytes| {
                    bincode::deserialize(bytes).map_err(|e| TypesError::Batch {
                        batch,
                        message: e.to_string(),
                    })
                })
                .collect()
        })
        .collect();

    let mut out = Vec::with_capacity(raw.len());
    for batch in batches {
        out.extend(batch?);
    }
    Ok(out)
}

/// Root over the transaction ids. Empty blocks have the zero root.
pub fn compute_tx_root(txs: &[Transaction]) -> Hash {
    if txs.is_empty() {
        return ZERO_HASH;
    }
    let batch_roots: Vec<Hash> = txs
        .par_chunks(TX_BATCH_SIZE)
        .map(|chunk| {
            let mut hasher = Hasher::new();
            for tx in chunk {
                hasher.update_field(tx.tx_id.as_bytes());
            }
            hasher.finalize()
        })
        .collect();

    let mut hasher = Hasher::new();
    for root in &batch_roots {
        hasher.update(root);
    }
    hasher.finalize()
}

/// Hash of the bincode-encoded DAG.
pub fn compute_dag_hash(dag: &Dag) -> Result<Hash> {
    Ok(hotchain_crypto::keccak256(&bincode::serialize(dag)?))
}

/// Root over the read/write sets, batched like [`compute_tx_root`].
pub fn compute_rw_set_root(rwsets: &[TxRWSet]) -> Result<Hash> {
    if rwsets.is_empty() {
        return Ok(ZERO_HASH);
    }
    let batch_roots: Vec<Result<Hash>> = rwsets
        .par_chunks(TX_BATCH_SIZE)
        .map(|chunk| {
            let mut hasher = Hasher::new();
            for rwset in chunk {
                hasher.update_field(&bincode::serialize(rwset)?);
            }
            Ok(hasher.finalize())
        })
        .collect();

    let mut hasher = Hasher::new();
    for root in batch_roots {
        hasher.update(&root?);
    }
    Ok(hasher.finalize())
}

/// Serialize a block: header and metadata with bincode, transactions via
/// [`marshal_txs`].
pub fn encode_block(block: &Block) -> Result<Vec<u8>> {
    let txs = marshal_txs(&block.txs)?;
    let shell = Block {
        txs: Vec::new(),
        ..block.clone()
    };
    Ok(bincode::serialize(&(shell, txs))?)
}

/// Inverse of [`encode_block`].
pub fn decode_block(bytes: &[u8]) -> Result<Block> {
    let (mut block, txs): (Block, Vec<Vec<u8>>) = bincode::deserialize(bytes)?;
    block.txs = unmarshal_txs(&txs)?;
    Ok(block)
}
