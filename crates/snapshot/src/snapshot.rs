//! Per-block read/write cache with optimistic conflict detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hotchain_core::BlockchainStore;
use hotchain_types::{Block, Dag, Fingerprint, Hash, Member, Transaction, TxRWSet, TxResult};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::context::{SpecialTxType, TxSimContext};
use crate::dag::build_dag;
use crate::manager::SnapshotArena;
use crate::{state_key, SnapshotError, SnapshotResult};

/// A value tagged with the apply sequence of the transaction that
/// produced it.
#[derive(Debug, Clone)]
struct SeqValue {
    seq: usize,
    value: Vec<u8>,
}

#[derive(Default)]
struct Tables {
    tx_table: Vec<Transaction>,
    special_tx_table: Vec<Transaction>,
    tx_result_map: HashMap<String, TxResult>,
    tx_rwset_table: Vec<TxRWSet>,
    read_table: HashMap<Vec<u8>, SeqValue>,
    write_table: HashMap<Vec<u8>, SeqValue>,
}

/// Result of [`Snapshot::apply_tx_sim_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The transaction was appended
    Applied {
        /// Snapshot size after the apply
        size: usize,
    },
    /// A key it read was written at or after its exec sequence
    Conflict {
        /// Current snapshot size, the exec sequence for a retry
        size: usize,
    },
    /// The snapshot no longer accepts ordinary transactions
    Sealed {
        /// Final snapshot size
        size: usize,
    },
}

impl ApplyOutcome {
    /// Whether the transaction was appended.
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    /// Snapshot size reported with the outcome.
    pub fn size(&self) -> usize {
        match *self {
            ApplyOutcome::Applied { size }
            | ApplyOutcome::Conflict { size }
            | ApplyOutcome::Sealed { size } => size,
        }
    }
}

/// One key of a batch read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchKey {
    /// Owning contract
    pub contract_name: String,
    /// State key
    pub key: Vec<u8>,
}

impl BatchKey {
    /// Create a batch key.
    pub fn new(contract_name: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            contract_name: contract_name.into(),
            key: key.into(),
        }
    }
}

/// Read/write cache for the transactions of one block.
///
/// Many workers call [`apply_tx_sim_context`](Self::apply_tx_sim_context)
/// concurrently. Reads that miss the local tables walk the parent
/// snapshots, which belong to blocks that are ordered but not yet
/// committed, and finally fall through to the store.
pub struct Snapshot {
    chain_id: String,
    block_height: u64,
    block_version: u32,
    block_timestamp: i64,
    block_proposer: Option<Member>,
    pre_block_hash: Hash,
    block_fingerprint: Fingerprint,
    pre_snapshot: RwLock<Option<Fingerprint>>,
    arena: Weak<SnapshotArena>,
    store: Arc<dyn BlockchainStore>,
    legacy_read_version_threshold: u32,
    sealed: AtomicBool,
    tables: RwLock<Tables>,
}

impl Snapshot {
    pub(crate) fn new(
        block: &Block,
        pre_snapshot: Option<Fingerprint>,
        arena: Weak<SnapshotArena>,
        store: Arc<dyn BlockchainStore>,
        legacy_read_version_threshold: u32,
    ) -> Self {
        let header = &block.header;
        Self {
            chain_id: header.chain_id.clone(),
            block_height: header.block_height,
            block_version: header.block_version,
            block_timestamp: header.block_timestamp,
            block_proposer: header.proposer.clone(),
            pre_block_hash: header.pre_block_hash,
            block_fingerprint: block.fingerprint(),
            pre_snapshot: RwLock::new(pre_snapshot),
            arena,
            store,
            legacy_read_version_threshold,
            sealed: AtomicBool::new(false),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Apply a simulated transaction.
    ///
    /// Ordinary transactions are rejected once the snapshot is sealed.
    /// `apply_special_tx` lets the scheduler append after sealing.
    /// Iterator transactions go to the side table without conflict checks.
    pub fn apply_tx_sim_context(
        &self,
        ctx: &dyn TxSimContext,
        special_tx_type: SpecialTxType,
        run_vm_success: bool,
        apply_special_tx: bool,
    ) -> ApplyOutcome {
        if !apply_special_tx && self.is_sealed() {
            return ApplyOutcome::Sealed {
                size: self.snapshot_size(),
            };
        }

        let mut tables = self.tables.write();
        if !apply_special_tx && self.is_sealed() {
            return ApplyOutcome::Sealed {
                size: tables.tx_table.len(),
            };
        }

        let tx = ctx.tx();
        if special_tx_type == SpecialTxType::Iterator {
            tables.special_tx_table.push(tx.clone());
            trace!(tx_id = %tx.tx_id, "Appended iterator transaction");
            return ApplyOutcome::Applied {
                size: tables.tx_table.len() + tables.special_tx_table.len(),
            };
        }

        let exec_seq = ctx.tx_exec_seq();
        let rwset = ctx.tx_rwset(run_vm_success);
        let apply_seq = tables.tx_table.len();

        if exec_seq < apply_seq {
            for read in &rwset.tx_reads {
                let key = state_key(&read.contract_name, &read.key);
                if let Some(sv) = tables.write_table.get(&key) {
                    if sv.seq >= exec_seq {
                        debug!(
                            tx_id = %tx.tx_id,
                            exec_seq,
                            write_seq = sv.seq,
                            contract = %read.contract_name,
                            "Read conflicts with a later write"
                        );
                        return ApplyOutcome::Conflict { size: apply_seq };
                    }
                }
            }
        }

        for write in &rwset.tx_writes {
            tables.write_table.insert(
                state_key(&write.contract_name, &write.key),
                SeqValue {
                    seq: apply_seq,
                    value: write.value.clone(),
                },
            );
        }
        if run_vm_success || self.block_version < self.legacy_read_version_threshold {
            for read in &rwset.tx_reads {
                tables.read_table.insert(
                    state_key(&read.contract_name, &read.key),
                    SeqValue {
                        seq: apply_seq,
                        value: read.value.clone(),
                    },
                );
            }
        }

        tables
            .tx_result_map
            .insert(tx.tx_id.clone(), ctx.tx_result().clone());
        tables.tx_table.push(tx.clone());
        tables.tx_rwset_table.push(rwset);

        ApplyOutcome::Applied {
            size: tables.tx_table.len(),
        }
    }

    /// Value of `key` as seen by a transaction at `tx_exec_seq`.
    ///
    /// Resolution order: write table, read table, parent snapshots, store.
    /// The latest applied value is returned even when its sequence is at
    /// or above `tx_exec_seq`; the later apply then reports a conflict.
    pub fn get_key(
        &self,
        tx_exec_seq: usize,
        contract_name: &str,
        key: &[u8],
    ) -> SnapshotResult<Option<Vec<u8>>> {
        let sk = state_key(contract_name, key);
        if let Some((seq, value)) = self.lookup_local(&sk) {
            if seq >= tx_exec_seq {
                trace!(
                    height = self.block_height,
                    seq,
                    tx_exec_seq,
                    contract = contract_name,
                    "Read observes a newer write"
                );
            }
            return Ok(Some(value));
        }

        let mut current = self.parent()?;
        while let Some(snapshot) = current {
            if let Some((_, value)) = snapshot.lookup_local(&sk) {
                return Ok(Some(value));
            }
            current = snapshot.parent()?;
        }

        Ok(self.store.read_object(contract_name, key)?)
    }

    /// [`get_key`](Self::get_key) for several keys.
    pub fn get_keys(
        &self,
        tx_exec_seq: usize,
        keys: &[BatchKey],
    ) -> SnapshotResult<Vec<Option<Vec<u8>>>> {
        keys.iter()
            .map(|k| self.get_key(tx_exec_seq, &k.contract_name, &k.key))
            .collect()
    }

    fn lookup_local(&self, sk: &[u8]) -> Option<(usize, Vec<u8>)> {
        let tables = self.tables.read();
        tables
            .write_table
            .get(sk)
            .or_else(|| tables.read_table.get(sk))
            .map(|sv| (sv.seq, sv.value.clone()))
    }

    /// Parent snapshot, if it is still tracked.
    fn parent(&self) -> SnapshotResult<Option<Arc<Snapshot>>> {
        let Some(fingerprint) = *self.pre_snapshot.read() else {
            return Ok(None);
        };
        let arena = self.arena.upgrade().ok_or(SnapshotError::Detached {
            height: self.block_height,
        })?;
        let parent = arena.read().get(&fingerprint).cloned();
        Ok(parent.filter(|p| p.block_height < self.block_height))
    }

    /// Stop accepting ordinary transactions.
    pub fn seal(&self) {
        let _tables = self.tables.write();
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Whether [`seal`](Self::seal) was called.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Build the block DAG from the applied read/write sets.
    pub fn build_dag(&self, is_sql: bool) -> Dag {
        if !self.is_sealed() {
            warn!(
                height = self.block_height,
                "Building DAG of an unsealed snapshot"
            );
        }
        let tables = self.tables.read();
        build_dag(&tables.tx_rwset_table, is_sql)
    }

    /// Number of applied ordinary transactions.
    pub fn snapshot_size(&self) -> usize {
        self.tables.read().tx_table.len()
    }

    /// Applied ordinary transactions, in apply order.
    pub fn tx_table(&self) -> Vec<Transaction> {
        self.tables.read().tx_table.clone()
    }

    /// Applied iterator transactions.
    pub fn special_tx_table(&self) -> Vec<Transaction> {
        self.tables.read().special_tx_table.clone()
    }

    /// Results keyed by transaction id.
    pub fn tx_result_map(&self) -> HashMap<String, TxResult> {
        self.tables.read().tx_result_map.clone()
    }

    /// Read/write sets, in apply order.
    pub fn tx_rwset_table(&self) -> Vec<TxRWSet> {
        self.tables.read().tx_rwset_table.clone()
    }

    /// Fingerprint of the parent block's snapshot, while it is linked.
    pub fn pre_snapshot(&self) -> Option<Fingerprint> {
        *self.pre_snapshot.read()
    }

    pub(crate) fn set_pre_snapshot(&self, pre: Option<Fingerprint>) {
        *self.pre_snapshot.write() = pre;
    }

    /// Chain id of the block.
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Height of the block.
    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    /// Block timestamp.
    pub fn block_timestamp(&self) -> i64 {
        self.block_timestamp
    }

    /// Block proposer.
    pub fn block_proposer(&self) -> Option<&Member> {
        self.block_proposer.as_ref()
    }

    /// Parent block hash.
    pub fn pre_block_hash(&self) -> Hash {
        self.pre_block_hash
    }

    /// Fingerprint of the block.
    pub fn block_fingerprint(&self) -> Fingerprint {
        self.block_fingerprint
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("height", &self.block_height)
            .field("fingerprint", &hex::encode(&self.block_fingerprint[..8]))
            .field("sealed", &self.is_sealed())
            .field("size", &self.snapshot_size())
            .finish()
    }
}
