//! Transaction dependency DAG.
//!
//! Vertex `i` lists the direct predecessors of transaction `i`. In
//! key-value mode an edge `i -> j` exists when transaction `i`
//!
//! - reads a key last written by `j`, or
//! - writes a key last written by `j` or read by `j` since that write,
//!
//! and `j` is not already reachable through another predecessor of `i`.
//! Per-key writer and reader indexes keep the scan linear in the number
//! of accessed keys. Reachability is one bitmap per transaction.

use std::collections::{BTreeSet, HashMap};

use bitvec::prelude::*;
use hotchain_types::{Dag, DagNeighbors, TxRWSet};

use crate::state_key;

#[derive(Default)]
struct KeyAccess {
    last_writer: Option<usize>,
    readers_since_write: Vec<usize>,
}

/// Build the DAG for `rwsets`, in block order.
///
/// SQL mode serializes the block: every transaction depends on the one
/// before it.
pub fn build_dag(rwsets: &[TxRWSet], is_sql: bool) -> Dag {
    if is_sql {
        return linear_dag(rwsets.len());
    }

    let n = rwsets.len();
    let mut access: HashMap<Vec<u8>, KeyAccess> = HashMap::new();
    let mut reach: Vec<BitVec> = Vec::with_capacity(n);
    let mut vertexes = Vec::with_capacity(n);

    for (i, rwset) in rwsets.iter().enumerate() {
        let read_keys: Vec<Vec<u8>> = rwset
            .tx_reads
            .iter()
            .map(|r| state_key(&r.contract_name, &r.key))
            .collect();
        let write_keys: Vec<Vec<u8>> = rwset
            .tx_writes
            .iter()
            .map(|w| state_key(&w.contract_name, &w.key))
            .collect();

        let mut candidates = BTreeSet::new();
        for key in &read_keys {
            if let Some(writer) = access.get(key).and_then(|a| a.last_writer) {
                candidates.insert(writer);
            }
        }
        for key in &write_keys {
            if let Some(a) = access.get(key) {
                candidates.extend(a.last_writer);
                candidates.extend(a.readers_since_write.iter().copied());
            }
        }

        let mut reachable = bitvec![0; n];
        let mut neighbors = Vec::new();
        for &j in candidates.iter().rev() {
            if reachable[j] {
                continue;
            }
            neighbors.push(j as u32);
            reachable.set(j, true);
            reachable |= reach[j].as_bitslice();
        }
        neighbors.reverse();
        reach.push(reachable);
        vertexes.push(DagNeighbors { neighbors });

        for key in read_keys {
            let a = access.entry(key).or_default();
            if a.readers_since_write.last() != Some(&i) {
                a.readers_since_write.push(i);
            }
        }
        for key in write_keys {
            let a = access.entry(key).or_default();
            a.last_writer = Some(i);
            a.readers_since_write.clear();
        }
    }

    Dag { vertexes }
}

fn linear_dag(n: usize) -> Dag {
    Dag {
        vertexes: (0..n)
            .map(|i| DagNeighbors {
                neighbors: if i == 0 { Vec::new() } else { vec![i as u32 - 1] },
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotchain_types::{TxRead, TxWrite};

    fn rwset(reads: &[&str], writes: &[&str]) -> TxRWSet {
        TxRWSet {
            tx_id: String::new(),
            tx_reads: reads.iter().map(|k| TxRead::new("kv", k.as_bytes(), Vec::<u8>::new())).collect(),
            tx_writes: writes
                .iter()
                .map(|k| TxWrite::new("kv", k.as_bytes(), vec![1u8]))
                .collect(),
        }
    }

    #[test]
    fn test_read_after_write_then_overwrite() {
        // read-after-write puts tx1 after tx0 (it reads k1, which tx0 wrote);
        // write-after-read puts tx2 after tx1. tx2's edge to tx0 is implied
        // through tx1, so the result is [[], [0], [1]], not [[], [], [0, 1]]
        let dag = build_dag(
            &[rwset(&[], &["k1"]), rwset(&["k1"], &[]), rwset(&["k2"], &["k1"])],
            false,
        );
        assert_eq!(dag.neighbor_lists(), vec![vec![], vec![0], vec![1]]);
    }

    #[test]
    fn test_independent_transactions_have_no_edges() {
        let dag = build_dag(
            &[rwset(&["a"], &["a"]), rwset(&["b"], &["b"]), rwset(&["c"], &[])],
            false,
        );
        assert_eq!(dag.neighbor_lists(), vec![Vec::<u32>::new(); 3]);
    }

    #[test]
    fn test_writer_waits_for_all_readers() {
        let dag = build_dag(
            &[
                rwset(&["x"], &[]),
                rwset(&["x"], &[]),
                rwset(&["y"], &[]),
                rwset(&[], &["x"]),
            ],
            false,
        );
        assert_eq!(dag.neighbor_lists(), vec![vec![], vec![], vec![], vec![0, 1]]);
    }

    #[test]
    fn test_transitive_edges_are_dropped() {
        // 0 -> 1 -> 2 over different keys, 3 touches all of them
        let dag = build_dag(
            &[
                rwset(&[], &["a"]),
                rwset(&["a"], &["b"]),
                rwset(&["b"], &["c"]),
                rwset(&["a", "b", "c"], &[]),
            ],
            false,
        );
        assert_eq!(dag.neighbor_lists(), vec![vec![], vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_same_key_in_other_contract_is_independent() {
        let a = TxRWSet {
            tx_id: "a".into(),
            tx_reads: vec![],
            tx_writes: vec![TxWrite::new("c1", b"k".to_vec(), vec![1u8])],
        };
        let b = TxRWSet {
            tx_id: "b".into(),
            tx_reads: vec![TxRead::new("c2", b"k".to_vec(), Vec::<u8>::new())],
            tx_writes: vec![],
        };
        assert_eq!(build_dag(&[a, b], false).neighbor_lists(), vec![vec![], vec![]]);
    }

    #[test]
    fn test_sql_mode_is_a_chain() {
        let sets = vec![rwset(&["a"], &[]), rwset(&["b"], &[]), rwset(&["c"], &[])];
        assert_eq!(build_dag(&sets, true).neighbor_lists(), vec![vec![], vec![0], vec![1]]);
        assert!(build_dag(&[], true).vertexes.is_empty());
    }
}
