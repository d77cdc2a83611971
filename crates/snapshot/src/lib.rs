//! # Hotchain Snapshot
//!
//! Per-block execution state for concurrently simulated transactions:
//!
//! - **Snapshot**: the read/write cache of one block. Workers apply their
//!   simulation results concurrently; an apply whose reads were overtaken
//!   by a later-or-equal write is rejected and retried by the scheduler.
//! - **DAG builder**: turns the applied read/write sets into the block's
//!   transaction dependency graph.
//! - **Snapshot manager**: keys snapshots by block fingerprint, links each
//!   one to its parent's snapshot and drops them as blocks commit.
//!
//! ```text
//!   worker ──► SimContext ──► Snapshot::apply_tx_sim_context
//!                  │                  │ conflict? retry with new exec seq
//!                  ▼                  ▼
//!          Snapshot::get_key    seal ──► build_dag ──► Block.dag
//!                  │
//!   write table ─► read table ─► parent snapshots ─► BlockchainStore
//! ```
//!
//! Sequence numbers are assigned under the snapshot write lock in apply
//! order. A transaction that started when the snapshot held `n` entries
//! carries `tx_exec_seq = n` and may only have read writes with a lower
//! sequence.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod context;
pub mod dag;
pub mod manager;
pub mod snapshot;

pub use context::{SimContext, SpecialTxType, TxSimContext};
pub use dag::build_dag;
pub use manager::{ManagerConfig, SnapshotArena, SnapshotManager};
pub use snapshot::{ApplyOutcome, BatchKey, Snapshot};

use hotchain_core::StorageError;
use thiserror::Error;

/// Errors raised while reading through a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The backing store failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The snapshot still points at a parent but its manager is gone
    #[error("snapshot at height {height} outlived its manager")]
    Detached {
        /// Height of the orphaned snapshot
        height: u64,
    },
}

/// Result type for snapshot reads.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Key under which a contract's state entry is tracked.
///
/// The contract name is length-prefixed so that no two (contract, key)
/// pairs collide.
pub(crate) fn state_key(contract_name: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + contract_name.len() + key.len());
    out.extend_from_slice(&(contract_name.len() as u32).to_be_bytes());
    out.extend_from_slice(contract_name.as_bytes());
    out.extend_from_slice(key);
    out
}
