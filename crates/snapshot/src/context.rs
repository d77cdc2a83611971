//! Transaction simulation contexts handed to [`Snapshot::apply_tx_sim_context`].
//!
//! [`Snapshot::apply_tx_sim_context`]: crate::Snapshot::apply_tx_sim_context

use std::collections::HashMap;

use hotchain_types::{Transaction, TxRWSet, TxRead, TxResult, TxWrite};

use crate::{state_key, Snapshot, SnapshotResult};

/// How a transaction is scheduled within the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SpecialTxType {
    /// Ordinary transaction, conflict-checked
    #[default]
    None,
    /// Iterator transaction, appended to the side table in arrival order
    Iterator,
}

/// Outcome of simulating one transaction against a snapshot.
pub trait TxSimContext: Send + Sync {
    /// The simulated transaction.
    fn tx(&self) -> &Transaction;

    /// Execution result.
    fn tx_result(&self) -> &TxResult;

    /// Read/write set of the run. A failed VM run carries no writes.
    fn tx_rwset(&self, run_vm_success: bool) -> TxRWSet;

    /// Snapshot size observed when the simulation started.
    fn tx_exec_seq(&self) -> usize;
}

/// Plain [`TxSimContext`] that records reads and writes as a VM performs
/// them.
///
/// Reads go through the context's own pending writes first, then through
/// the snapshot.
#[derive(Debug, Clone)]
pub struct SimContext {
    tx: Transaction,
    result: TxResult,
    exec_seq: usize,
    reads: Vec<TxRead>,
    writes: Vec<TxWrite>,
    read_index: HashMap<Vec<u8>, usize>,
    write_index: HashMap<Vec<u8>, usize>,
}

impl SimContext {
    /// Start simulating `tx` against a snapshot currently holding
    /// `exec_seq` transactions.
    pub fn new(tx: Transaction, exec_seq: usize) -> Self {
        Self {
            tx,
            result: TxResult::default(),
            exec_seq,
            reads: Vec::new(),
            writes: Vec::new(),
            read_index: HashMap::new(),
            write_index: HashMap::new(),
        }
    }

    /// Start simulating `tx` at the snapshot's current size.
    pub fn begin(tx: Transaction, snapshot: &Snapshot) -> Self {
        Self::new(tx, snapshot.snapshot_size())
    }

    /// Read a key, recording the observed value.
    ///
    /// Missing keys are recorded with an empty value.
    pub fn get(
        &mut self,
        snapshot: &Snapshot,
        contract_name: &str,
        key: &[u8],
    ) -> SnapshotResult<Option<Vec<u8>>> {
        let sk = state_key(contract_name, key);
        if let Some(&i) = self.write_index.get(&sk) {
            return Ok(Some(self.writes[i].value.clone()));
        }
        if let Some(&i) = self.read_index.get(&sk) {
            let value = &self.reads[i].value;
            return Ok((!value.is_empty()).then(|| value.clone()));
        }
        let value = snapshot.get_key(self.exec_seq, contract_name, key)?;
        self.read_index.insert(sk, self.reads.len());
        self.reads.push(TxRead::new(
            contract_name,
            key,
            value.clone().unwrap_or_default(),
        ));
        Ok(value)
    }

    /// Record a write. A later write to the same key replaces the value.
    pub fn put(&mut self, contract_name: &str, key: &[u8], value: impl Into<Vec<u8>>) {
        let sk = state_key(contract_name, key);
        let value = value.into();
        match self.write_index.get(&sk) {
            Some(&i) => self.writes[i].value = value,
            None => {
                self.write_index.insert(sk, self.writes.len());
                self.writes.push(TxWrite::new(contract_name, key, value));
            }
        }
    }

    /// Record a read without consulting a snapshot.
    pub fn record_read(&mut self, contract_name: &str, key: &[u8], value: impl Into<Vec<u8>>) {
        let sk = state_key(contract_name, key);
        if self.read_index.contains_key(&sk) {
            return;
        }
        self.read_index.insert(sk, self.reads.len());
        self.reads.push(TxRead::new(contract_name, key, value));
    }

    /// Set the execution result.
    pub fn set_result(&mut self, result: TxResult) {
        self.result = result;
    }

    /// Number of distinct keys read so far.
    pub fn read_count(&self) -> usize {
        self.reads.len()
    }
}

impl TxSimContext for SimContext {
    fn tx(&self) -> &Transaction {
        &self.tx
    }

    fn tx_result(&self) -> &TxResult {
        &self.result
    }

    fn tx_rwset(&self, run_vm_success: bool) -> TxRWSet {
        TxRWSet {
            tx_id: self.tx.tx_id.clone(),
            tx_reads: self.reads.clone(),
            tx_writes: if run_vm_success {
                self.writes.clone()
            } else {
                Vec::new()
            },
        }
    }

    fn tx_exec_seq(&self) -> usize {
        self.exec_seq
    }
}
