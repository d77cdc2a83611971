//! Chain store: the SMR's cache of certified and pending blocks.
//!
//! Blocks above the committed height form a tree rooted at the last
//! committed block. Each entry remembers the level it was proposed at and,
//! once known, the QC that certifies it. The three-chain commit rule is
//! evaluated here, and committing hands blocks to the [`BlockCommitter`] in
//! ascending height order with their QC embedded in the additional data.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hotchain_core::{BlockCommitter, BlockError, BlockchainStore, LedgerCache, StorageError};
use hotchain_types::{Block, Hash};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{BlockPair, QuorumCert};

/// Chain store errors.
#[derive(Debug, Error)]
pub enum ChainStoreError {
    /// Neither the ledger nor the store has a committed block
    #[error("no committed block to bootstrap from")]
    NoCommittedBlock,

    /// The parent of an inserted block is unknown
    #[error("parent {parent} of block at height {height} is unknown")]
    UnknownParent {
        /// Height of the orphan
        height: u64,
        /// Missing parent hash (hex)
        parent: String,
    },

    /// A QC names a block that is not cached
    #[error("qc at height {height} names unknown block {block}")]
    UnknownBlock {
        /// QC height
        height: u64,
        /// Block hash (hex)
        block: String,
    },

    /// The block does not fit under its parent
    #[error("invalid block at height {height}: {reason}")]
    InvalidBlock {
        /// Height
        height: u64,
        /// Reason
        reason: String,
    },

    /// A block on the commit path has no QC
    #[error("block at height {0} has no qc")]
    MissingQc(u64),

    /// QC encoding failed
    #[error("qc codec: {0}")]
    Codec(String),

    /// The committer rejected a block
    #[error(transparent)]
    Commit(#[from] BlockError),

    /// Store read failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for chain store operations
pub type ChainStoreResult<T> = Result<T, ChainStoreError>;

/// A cached block.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    /// The block
    pub block: Block,
    /// Level it was proposed at
    pub level: u64,
    /// Certificate for the block, once formed
    pub qc: Option<QuorumCert>,
}

/// Cache of blocks above (and including) the committed tip.
pub struct ChainStore {
    committer: Arc<dyn BlockCommitter>,
    store: Arc<dyn BlockchainStore>,
    blocks: HashMap<Hash, ChainEntry>,
    by_height: BTreeMap<u64, Vec<Hash>>,
    commit_height: u64,
    commit_block: Hash,
    current_qc: QuorumCert,
    retention: u64,
}

impl ChainStore {
    /// Bootstrap from the highest committed block.
    ///
    /// The QC embedded in that block's additional data becomes the current
    /// QC. A block without one (genesis) is certified by a level-0 QC.
    pub fn open(
        ledger: Arc<dyn LedgerCache>,
        committer: Arc<dyn BlockCommitter>,
        store: Arc<dyn BlockchainStore>,
        retention: u64,
    ) -> ChainStoreResult<Self> {
        let last = match ledger.get_last_committed_block() {
            Some(block) => block,
            None => store
                .get_last_block()?
                .ok_or(ChainStoreError::NoCommittedBlock)?,
        };

        let qc = match last.qc_bytes().map(QuorumCert::decode) {
            Some(Ok(qc)) if qc.block_id == last.hash() => qc,
            Some(Ok(qc)) => {
                warn!(
                    height = last.height(),
                    qc_height = qc.height,
                    "embedded qc does not certify the committed block, using level 0"
                );
                QuorumCert::genesis(&last, 0)
            }
            Some(Err(e)) => return Err(ChainStoreError::Codec(e.to_string())),
            None => QuorumCert::genesis(&last, 0),
        };

        info!(
            height = last.height(),
            level = qc.level,
            block_hash = hex::encode(&last.hash()[..8]),
            "Chain store opened"
        );

        let hash = last.hash();
        let height = last.height();
        let mut chain = Self {
            committer,
            store,
            blocks: HashMap::new(),
            by_height: BTreeMap::new(),
            commit_height: height,
            commit_block: hash,
            current_qc: qc.clone(),
            retention,
        };
        chain.index(ChainEntry {
            block: last,
            level: qc.level,
            qc: Some(qc),
        });
        Ok(chain)
    }

    fn index(&mut self, entry: ChainEntry) {
        let hash = entry.block.hash();
        self.by_height
            .entry(entry.block.height())
            .or_default()
            .push(hash);
        self.blocks.insert(hash, entry);
    }

    /// Height of the last committed block.
    pub fn get_commit_height(&self) -> u64 {
        self.commit_height
    }

    /// Hash of the last committed block.
    pub fn commit_block_hash(&self) -> Hash {
        self.commit_block
    }

    /// Highest-level block QC seen.
    pub fn get_current_qc(&self) -> &QuorumCert {
        &self.current_qc
    }

    /// Cached entry for `hash`.
    pub fn get(&self, hash: &Hash) -> Option<&ChainEntry> {
        self.blocks.get(hash)
    }

    /// Whether `hash` is cached.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether nothing is cached. Never true after `open`.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Cache a block proposed at `level`. Its parent must be cached.
    pub fn insert_block(&mut self, block: Block, level: u64) -> ChainStoreResult<()> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Ok(());
        }
        let height = block.height();
        if height <= self.commit_height {
            return Err(ChainStoreError::InvalidBlock {
                height,
                reason: format!("at or below committed height {}", self.commit_height),
            });
        }
        let parent = self
            .blocks
            .get(&block.header.pre_block_hash)
            .ok_or_else(|| ChainStoreError::UnknownParent {
                height,
                parent: hex::encode(block.header.pre_block_hash),
            })?;
        if parent.block.height() + 1 != height {
            return Err(ChainStoreError::InvalidBlock {
                height,
                reason: format!("parent height is {}", parent.block.height()),
            });
        }
        if level <= parent.level {
            return Err(ChainStoreError::InvalidBlock {
                height,
                reason: format!("level {level} not above parent level {}", parent.level),
            });
        }

        debug!(height, level, block_hash = hex::encode(&hash[..8]), "Inserted block");
        self.index(ChainEntry {
            block,
            level,
            qc: None,
        });
        Ok(())
    }

    /// Attach a block QC. Raises the current QC when the level is higher.
    pub fn insert_qc(&mut self, qc: QuorumCert) -> ChainStoreResult<()> {
        let entry = self
            .blocks
            .get_mut(&qc.block_id)
            .ok_or_else(|| ChainStoreError::UnknownBlock {
                height: qc.height,
                block: hex::encode(qc.block_id),
            })?;
        if qc.level > self.current_qc.level {
            self.current_qc = qc.clone();
        }
        if entry.qc.is_none() {
            entry.qc = Some(qc);
        }
        Ok(())
    }

    /// QC of the parent of `hash`, i.e. the block's justify.
    pub fn parent_qc(&self, hash: &Hash) -> Option<&QuorumCert> {
        let entry = self.blocks.get(hash)?;
        self.blocks.get(&entry.block.header.pre_block_hash)?.qc.as_ref()
    }

    /// Whether `descendant` extends `ancestor` through cached parents.
    pub fn extends(&self, descendant: &Hash, ancestor: &Hash) -> bool {
        let mut cursor = *descendant;
        loop {
            if cursor == *ancestor {
                return true;
            }
            match self.blocks.get(&cursor) {
                Some(entry) if entry.block.height() > self.commit_height => {
                    cursor = entry.block.header.pre_block_hash;
                }
                _ => return false,
            }
        }
    }

    /// Block made committable by `qc` under the three-chain rule.
    ///
    /// With `qc` certifying B, B's parent P and P's parent G must sit at
    /// consecutive levels `G, G+1, G+2`. G is then committable if it is not
    /// yet committed.
    pub fn committable_block(&self, qc: &QuorumCert) -> Option<Hash> {
        if qc.new_view {
            return None;
        }
        let b = self.blocks.get(&qc.block_id)?;
        let p = self.blocks.get(&b.block.header.pre_block_hash)?;
        let g = self.blocks.get(&p.block.header.pre_block_hash)?;
        let consecutive = p.level + 1 == b.level && g.level + 1 == p.level;
        (consecutive && g.block.height() > self.commit_height).then(|| g.block.hash())
    }

    /// Commit `hash` and every uncommitted ancestor, lowest first.
    pub fn commit_block(&mut self, hash: &Hash) -> ChainStoreResult<Vec<Block>> {
        let mut path = Vec::new();
        let mut cursor = *hash;
        while cursor != self.commit_block {
            let entry = self
                .blocks
                .get(&cursor)
                .ok_or_else(|| ChainStoreError::UnknownBlock {
                    height: self.commit_height + 1,
                    block: hex::encode(cursor),
                })?;
            if entry.block.height() <= self.commit_height {
                return Err(ChainStoreError::InvalidBlock {
                    height: entry.block.height(),
                    reason: "does not extend the committed chain".to_string(),
                });
            }
            path.push(cursor);
            cursor = entry.block.header.pre_block_hash;
        }

        let mut committed = Vec::with_capacity(path.len());
        for hash in path.into_iter().rev() {
            let Some(entry) = self.blocks.get(&hash) else {
                continue;
            };
            let qc = entry
                .qc
                .as_ref()
                .ok_or(ChainStoreError::MissingQc(entry.block.height()))?;
            let mut block = entry.block.clone();
            block.set_qc_bytes(
                qc.encode()
                    .map_err(|e| ChainStoreError::Codec(e.to_string()))?,
            );
            self.committer.add_block(&block)?;

            info!(
                height = block.height(),
                level = entry.level,
                block_hash = hex::encode(&hash[..8]),
                txs = block.txs.len(),
                "Committed block"
            );
            self.commit_height = block.height();
            self.commit_block = hash;
            committed.push(block);
        }
        Ok(committed)
    }

    /// Drop forks at or below the committed height and committed blocks
    /// older than the retention window.
    pub fn prune(&mut self) {
        let keep_from = self.commit_height.saturating_sub(self.retention);

        // Canonical hashes for retained committed heights
        let mut canonical = HashMap::new();
        let mut cursor = self.commit_block;
        while let Some(entry) = self.blocks.get(&cursor) {
            let height = entry.block.height();
            if height < keep_from {
                break;
            }
            canonical.insert(height, cursor);
            cursor = entry.block.header.pre_block_hash;
        }

        let commit_height = self.commit_height;
        let mut removed = Vec::new();
        self.by_height.retain(|height, hashes| {
            if *height < keep_from {
                removed.append(hashes);
                return false;
            }
            if *height <= commit_height {
                let keep = canonical.get(height);
                hashes.retain(|h| {
                    let retain = Some(h) == keep;
                    if !retain {
                        removed.push(*h);
                    }
                    retain
                });
            }
            !hashes.is_empty()
        });
        for hash in &removed {
            self.blocks.remove(hash);
        }
        if !removed.is_empty() {
            debug!(commit_height, removed = removed.len(), "Pruned chain store");
        }
    }

    /// Block and certificate for `hash`, from the cache or the store.
    pub fn get_block_pair(&self, hash: &Hash) -> ChainStoreResult<Option<BlockPair>> {
        if let Some(entry) = self.blocks.get(hash) {
            return Ok(entry.qc.clone().map(|qc| BlockPair {
                block: entry.block.clone(),
                qc,
            }));
        }
        let Some(block) = self.store.get_block_by_hash(hash)? else {
            return Ok(None);
        };
        let qc = match block.qc_bytes() {
            Some(bytes) => {
                QuorumCert::decode(bytes).map_err(|e| ChainStoreError::Codec(e.to_string()))?
            }
            None => QuorumCert::genesis(&block, 0),
        };
        Ok(Some(BlockPair { block, qc }))
    }

    /// Up to `count` certified blocks walking parents from `hash`, newest first.
    pub fn ancestors(&self, hash: &Hash, count: usize) -> ChainStoreResult<Vec<BlockPair>> {
        let mut pairs = Vec::with_capacity(count);
        let mut cursor = *hash;
        while pairs.len() < count {
            let Some(pair) = self.get_block_pair(&cursor)? else {
                break;
            };
            let height = pair.block.height();
            cursor = pair.block.header.pre_block_hash;
            pairs.push(pair);
            if height == 0 {
                break;
            }
        }
        Ok(pairs)
    }
}
