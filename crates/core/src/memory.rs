//! In-memory block store and ledger cache.

use hotchain_types::{Block, Hash, TxRWSet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::traits::{BlockchainStore, LedgerCache, StorageError, StorageResult};

#[derive(Default)]
struct StoreInner {
    blocks: BTreeMap<u64, Block>,
    heights: HashMap<Hash, u64>,
    state: HashMap<(String, Vec<u8>), Vec<u8>>,
}

/// A [`BlockchainStore`] kept entirely in memory.
///
/// Blocks must be written at consecutive heights. An empty write value
/// deletes the key.
#[derive(Default)]
pub struct MemoryBlockchainStore {
    inner: RwLock<StoreInner>,
}

impl MemoryBlockchainStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `genesis`.
    pub fn with_genesis(genesis: &Block) -> StorageResult<Self> {
        let store = Self::new();
        store.put_block(genesis, &[])?;
        Ok(store)
    }

    /// Seed a committed state value directly.
    pub fn put_object(&self, contract_name: &str, key: &[u8], value: Vec<u8>) {
        self.inner
            .write()
            .state
            .insert((contract_name.to_string(), key.to_vec()), value);
    }
}

impl BlockchainStore for MemoryBlockchainStore {
    fn get_block(&self, height: u64) -> StorageResult<Option<Block>> {
        Ok(self.inner.read().blocks.get(&height).cloned())
    }

    fn get_block_by_hash(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        let inner = self.inner.read();
        Ok(inner
            .heights
            .get(hash)
            .and_then(|h| inner.blocks.get(h))
            .cloned())
    }

    fn get_last_block(&self) -> StorageResult<Option<Block>> {
        Ok(self
            .inner
            .read()
            .blocks
            .last_key_value()
            .map(|(_, b)| b.clone()))
    }

    fn put_block(&self, block: &Block, rwsets: &[TxRWSet]) -> StorageResult<()> {
        let mut inner = self.inner.write();
        if let Some((&last, _)) = inner.blocks.last_key_value() {
            if block.height() != last + 1 {
                return Err(StorageError::NonSequentialHeight {
                    expected: last + 1,
                    got: block.height(),
                });
            }
        }
        for rwset in rwsets {
            for write in &rwset.tx_writes {
                let key = (write.contract_name.clone(), write.key.clone());
                if write.value.is_empty() {
                    inner.state.remove(&key);
                } else {
                    inner.state.insert(key, write.value.clone());
                }
            }
        }
        inner.heights.insert(block.hash(), block.height());
        inner.blocks.insert(block.height(), block.clone());
        debug!(height = block.height(), "stored block");
        Ok(())
    }

    fn read_object(&self, contract_name: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .inner
            .read()
            .state
            .get(&(contract_name.to_string(), key.to_vec()))
            .cloned())
    }
}

/// A [`LedgerCache`] holding the last committed block.
#[derive(Default)]
pub struct MemoryLedgerCache {
    last: RwLock<Option<Block>>,
}

impl MemoryLedgerCache {
    /// Create a cache whose tip is `block`.
    pub fn new(block: Option<Block>) -> Self {
        Self {
            last: RwLock::new(block),
        }
    }
}

impl LedgerCache for MemoryLedgerCache {
    fn get_last_committed_block(&self) -> Option<Block> {
        self.last.read().clone()
    }

    fn set_last_committed_block(&self, block: Block) {
        *self.last.write() = Some(block);
    }

    fn current_height(&self) -> StorageResult<u64> {
        self.last
            .read()
            .as_ref()
            .map(Block::height)
            .ok_or_else(|| StorageError::Internal("ledger has no committed block".into()))
    }
}
