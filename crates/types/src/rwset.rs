//! Read/write sets and the block dependency DAG.

use serde::{Deserialize, Serialize};

/// A key read by a transaction, with the value it observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRead {
    /// State key within the contract
    pub key: Vec<u8>,
    /// Observed value
    pub value: Vec<u8>,
    /// Owning contract
    pub contract_name: String,
}

/// A key written by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWrite {
    /// State key within the contract
    pub key: Vec<u8>,
    /// New value (empty means delete)
    pub value: Vec<u8>,
    /// Owning contract
    pub contract_name: String,
}

/// Everything a transaction read and wrote during simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRWSet {
    /// Transaction the set belongs to
    pub tx_id: String,
    /// Reads in execution order
    pub tx_reads: Vec<TxRead>,
    /// Writes in execution order
    pub tx_writes: Vec<TxWrite>,
}

impl TxRead {
    /// Create a read entry.
    pub fn new(contract_name: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            contract_name: contract_name.into(),
        }
    }
}

impl TxWrite {
    /// Create a write entry.
    pub fn new(contract_name: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            contract_name: contract_name.into(),
        }
    }
}

/// Direct predecessors of one transaction in the block DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNeighbors {
    /// Indices of transactions that must run first, ascending
    pub neighbors: Vec<u32>,
}

/// Per-block transaction dependency graph, one vertex per transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dag {
    /// Vertex `i` lists the direct predecessors of transaction `i`
    pub vertexes: Vec<DagNeighbors>,
}

impl Dag {
    /// Neighbor lists as plain vectors, handy for assertions.
    pub fn neighbor_lists(&self) -> Vec<Vec<u32>> {
        self.vertexes.iter().map(|v| v.neighbors.clone()).collect()
    }
}
