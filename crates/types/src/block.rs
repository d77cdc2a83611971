//! Block and BlockHeader types.
//!
//! Two identifiers exist for every block:
//! - the **block hash** ([`Block::compute_hash`]) covers the whole header,
//!   including the transaction root, and is what quorum certificates bind to
//! - the **fingerprint** ([`Block::fingerprint`]) covers only
//!   (chain id, height, timestamp, proposer, parent hash) and keys execution
//!   snapshots before the block's transactions are final

use hotchain_crypto::{Hash, Hasher, ZERO_HASH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{codec, Dag, Member, Transaction, TxRWSet};

/// Content identifier of a block excluding its transactions.
pub type Fingerprint = Hash;

/// `extra_data` key under which a committed block stores the QC certifying it.
pub const QC_EXTRA_KEY: &str = "chained_bft_qc";

/// Block format version written by this release. Failed VM runs in blocks
/// of this version no longer leave their reads in the snapshot read table.
pub const CURRENT_BLOCK_VERSION: u32 = 2201;

const FINGERPRINT_DOMAIN: &[u8] = b"hotchain/fingerprint";
const NON_CONSENSUS_FINGERPRINT_DOMAIN: &[u8] = b"hotchain/fingerprint/nc";
const BLOCK_HASH_DOMAIN: &[u8] = b"hotchain/block";

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Chain identifier
    pub chain_id: String,
    /// Height (genesis is 0)
    pub block_height: u64,
    /// Hash of the parent block
    pub pre_block_hash: Hash,
    /// Hash of this block, see [`Block::compute_hash`]
    pub block_hash: Hash,
    /// Block format version
    pub block_version: u32,
    /// Hash of the serialized DAG
    pub dag_hash: Hash,
    /// Root over the transactions' read/write sets
    pub rw_set_root: Hash,
    /// Root over the transaction ids
    pub tx_root: Hash,
    /// Unix timestamp in seconds
    pub block_timestamp: i64,
    /// Proposer identity, set once consensus assigns the block
    pub proposer: Option<Member>,
    /// Opaque consensus arguments
    pub consensus_args: Vec<u8>,
    /// Number of transactions
    pub tx_count: u32,
    /// Proposer signature over `block_hash`
    pub signature: Vec<u8>,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            chain_id: String::new(),
            block_height: 0,
            pre_block_hash: ZERO_HASH,
            block_hash: ZERO_HASH,
            block_version: CURRENT_BLOCK_VERSION,
            dag_hash: ZERO_HASH,
            rw_set_root: ZERO_HASH,
            tx_root: ZERO_HASH,
            block_timestamp: 0,
            proposer: None,
            consensus_args: Vec::new(),
            tx_count: 0,
            signature: Vec::new(),
        }
    }
}

/// Out-of-header data attached to a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalData {
    /// Keyed extra payloads
    pub extra_data: BTreeMap<String, Vec<u8>>,
}

/// A complete block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header
    pub header: BlockHeader,
    /// Transaction dependency graph
    pub dag: Dag,
    /// Transactions
    pub txs: Vec<Transaction>,
    /// Extra data (QC, etc.)
    pub additional_data: AdditionalData,
}

/// A committed block together with the read/write sets of its transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// The committed block
    pub block: Block,
    /// Read/write sets in transaction order
    pub rwsets: Vec<TxRWSet>,
}

impl Block {
    /// Build a block, filling in `tx_count`, `tx_root` and `block_hash`.
    pub fn new(mut header: BlockHeader, txs: Vec<Transaction>) -> Self {
        header.tx_count = txs.len() as u32;
        header.tx_root = codec::compute_tx_root(&txs);
        let mut block = Self {
            header,
            dag: Dag::default(),
            txs,
            additional_data: AdditionalData::default(),
        };
        block.header.block_hash = block.compute_hash();
        block
    }

    /// Genesis block for `chain_id`.
    pub fn genesis(chain_id: impl Into<String>) -> Self {
        Self::new(
            BlockHeader {
                chain_id: chain_id.into(),
                ..Default::default()
            },
            Vec::new(),
        )
    }

    /// Height shortcut.
    pub fn height(&self) -> u64 {
        self.header.block_height
    }

    /// The stored block hash.
    pub fn hash(&self) -> Hash {
        self.header.block_hash
    }

    /// Recompute the tx-inclusive block hash from header fields.
    ///
    /// `block_hash` and `signature` are excluded.
    pub fn compute_hash(&self) -> Hash {
        let h = &self.header;
        let mut hasher = Hasher::new();
        hasher.update(BLOCK_HASH_DOMAIN);
        hasher.update_field(h.chain_id.as_bytes());
        hasher.update_u64(h.block_height);
        hasher.update(&h.pre_block_hash);
        hasher.update_u64(u64::from(h.block_version));
        hasher.update(&h.dag_hash);
        hasher.update(&h.rw_set_root);
        hasher.update(&h.tx_root);
        hasher.update_i64(h.block_timestamp);
        hash_proposer(&mut hasher, h.proposer.as_ref());
        hasher.update_field(&h.consensus_args);
        hasher.update_u64(u64::from(h.tx_count));
        hasher.finalize()
    }

    /// Fingerprint over (chain id, height, timestamp, proposer, parent hash).
    ///
    /// Blocks without a proposer fall back to
    /// [`non_consensus_fingerprint`](Self::non_consensus_fingerprint).
    pub fn fingerprint(&self) -> Fingerprint {
        match &self.header.proposer {
            Some(proposer) => {
                let mut hasher = Hasher::new();
                hasher.update(FINGERPRINT_DOMAIN);
                self.hash_fingerprint_fields(&mut hasher);
                hash_proposer(&mut hasher, Some(proposer));
                hasher.finalize()
            }
            None => self.non_consensus_fingerprint(),
        }
    }

    /// Fingerprint that leaves out the consensus-assigned proposer.
    pub fn non_consensus_fingerprint(&self) -> Fingerprint {
        let mut hasher = Hasher::new();
        hasher.update(NON_CONSENSUS_FINGERPRINT_DOMAIN);
        self.hash_fingerprint_fields(&mut hasher);
        hasher.finalize()
    }

    fn hash_fingerprint_fields(&self, hasher: &mut Hasher) {
        hasher.update_field(self.header.chain_id.as_bytes());
        hasher.update_u64(self.header.block_height);
        hasher.update_i64(self.header.block_timestamp);
        hasher.update(&self.header.pre_block_hash);
    }

    /// Encoded QC stored in the additional data, if any.
    pub fn qc_bytes(&self) -> Option<&[u8]> {
        self.additional_data
            .extra_data
            .get(QC_EXTRA_KEY)
            .map(Vec::as_slice)
    }

    /// Attach an encoded QC to the additional data.
    pub fn set_qc_bytes(&mut self, qc: Vec<u8>) {
        self.additional_data
            .extra_data
            .insert(QC_EXTRA_KEY.to_string(), qc);
    }
}

fn hash_proposer(hasher: &mut Hasher, proposer: Option<&Member>) {
    match proposer {
        Some(member) => {
            hasher.update(&[1]);
            hasher.update_field(member.org_id.as_bytes());
            hasher.update_field(&member.member_info);
        }
        None => hasher.update(&[0]),
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block(height={}, hash={}, txs={})",
            self.header.block_height,
            hex::encode(&self.header.block_hash[..8]),
            self.txs.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            chain_id: "chain1".into(),
            block_height: height,
            block_timestamp: 1_700_000_000,
            proposer: Some(Member::new("org1", vec![1, 2, 3])),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_sets_hash_and_count() {
        let block = Block::new(header(3), vec![Transaction::invoke("tx1", "c", "m")]);
        assert_eq!(block.header.tx_count, 1);
        assert_eq!(block.hash(), block.compute_hash());
    }

    #[test]
    fn test_fingerprint_ignores_transactions() {
        let a = Block::new(header(3), vec![Transaction::invoke("tx1", "c", "m")]);
        let b = Block::new(header(3), vec![Transaction::invoke("tx2", "c", "m")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_non_consensus_fingerprint_ignores_proposer() {
        let a = Block::new(header(3), vec![]);
        let mut h = header(3);
        h.proposer = Some(Member::new("org2", vec![9]));
        let b = Block::new(h, vec![]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.non_consensus_fingerprint(), b.non_consensus_fingerprint());
    }

    #[test]
    fn test_block_without_proposer_uses_non_consensus_fingerprint() {
        let mut h = header(3);
        h.proposer = None;
        let block = Block::new(h, vec![]);
        assert_eq!(block.fingerprint(), block.non_consensus_fingerprint());
    }

    #[test]
    fn test_qc_bytes_do_not_change_hash() {
        let mut block = Block::new(header(1), vec![]);
        let before = block.compute_hash();
        block.set_qc_bytes(vec![7, 7]);
        assert_eq!(block.qc_bytes(), Some(&[7u8, 7][..]));
        assert_eq!(block.compute_hash(), before);
    }
}
