//! Block store and ledger traits.
//!
//! The store is synchronous: snapshot reads fall through to it from VM
//! worker threads that are not running on the async runtime.

use hotchain_types::{Block, Hash, TxRWSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// A block was written out of order.
    #[error("block height {got} does not follow {expected}")]
    NonSequentialHeight {
        /// Height the store expected next
        expected: u64,
        /// Height that was written
        got: u64,
    },

    /// A database I/O error occurred.
    #[error("database I/O error: {0}")]
    Io(String),

    /// A serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable block and state storage.
pub trait BlockchainStore: Send + Sync + 'static {
    /// Block at `height`.
    fn get_block(&self, height: u64) -> StorageResult<Option<Block>>;

    /// Block with hash `hash`.
    fn get_block_by_hash(&self, hash: &Hash) -> StorageResult<Option<Block>>;

    /// Highest stored block.
    fn get_last_block(&self) -> StorageResult<Option<Block>>;

    /// Persist a block and apply its transactions' writes atomically.
    fn put_block(&self, block: &Block, rwsets: &[TxRWSet]) -> StorageResult<()>;

    /// Committed value of `key` in `contract_name`.
    fn read_object(&self, contract_name: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;
}

/// In-memory view of the chain tip.
pub trait LedgerCache: Send + Sync + 'static {
    /// Last committed block, if any.
    fn get_last_committed_block(&self) -> Option<Block>;

    /// Record a new committed tip.
    fn set_last_committed_block(&self, block: Block);

    /// Height of the committed tip.
    fn current_height(&self) -> StorageResult<u64>;
}

impl<T: BlockchainStore + ?Sized> BlockchainStore for Arc<T> {
    fn get_block(&self, height: u64) -> StorageResult<Option<Block>> {
        (**self).get_block(height)
    }

    fn get_block_by_hash(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        (**self).get_block_by_hash(hash)
    }

    fn get_last_block(&self) -> StorageResult<Option<Block>> {
        (**self).get_last_block()
    }

    fn put_block(&self, block: &Block, rwsets: &[TxRWSet]) -> StorageResult<()> {
        (**self).put_block(block, rwsets)
    }

    fn read_object(&self, contract_name: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        (**self).read_object(contract_name, key)
    }
}
