//! Snapshot lifecycle keyed by block fingerprint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hotchain_core::BlockchainStore;
use hotchain_types::{Block, Fingerprint};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::snapshot::Snapshot;
use crate::SnapshotResult;

/// Live snapshots by block fingerprint.
pub type SnapshotArena = RwLock<HashMap<Fingerprint, Arc<Snapshot>>>;

/// Default GC horizon in blocks.
pub const DEFAULT_GC_HORIZON: u64 = 8;

/// Default block version below which failed runs still record reads.
pub const DEFAULT_LEGACY_READ_VERSION_THRESHOLD: u32 = 2201;

/// Snapshot manager settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Snapshots trailing the committed height by more than this are evicted
    pub gc_horizon: u64,
    /// Blocks below this version record reads from failed VM runs
    pub legacy_read_version_threshold: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            gc_horizon: DEFAULT_GC_HORIZON,
            legacy_read_version_threshold: DEFAULT_LEGACY_READ_VERSION_THRESHOLD,
        }
    }
}

/// Creates, links and retires block snapshots.
pub struct SnapshotManager {
    arena: Arc<SnapshotArena>,
    store: Arc<dyn BlockchainStore>,
    config: ManagerConfig,
    committed_height: AtomicU64,
}

impl SnapshotManager {
    /// Create a manager reading through to `store`.
    pub fn new(store: Arc<dyn BlockchainStore>, config: ManagerConfig) -> Self {
        Self {
            arena: Arc::new(RwLock::new(HashMap::new())),
            store,
            config,
            committed_height: AtomicU64::new(0),
        }
    }

    /// Snapshot for executing `block` on top of `prev_block`.
    ///
    /// Links to the parent's snapshot when it is still tracked. A
    /// snapshot already stored under the same fingerprint is replaced.
    pub fn new_snapshot(&self, prev_block: &Block, block: &Block) -> Arc<Snapshot> {
        let fingerprint = block.fingerprint();
        let prev_fingerprint = prev_block.fingerprint();

        let mut arena = self.arena.write();
        let pre = arena.contains_key(&prev_fingerprint).then_some(prev_fingerprint);
        let snapshot = Arc::new(Snapshot::new(
            block,
            pre,
            Arc::downgrade(&self.arena),
            self.store.clone(),
            self.config.legacy_read_version_threshold,
        ));
        if arena.insert(fingerprint, snapshot.clone()).is_some() {
            debug!(
                height = block.height(),
                fingerprint = hex::encode(&fingerprint[..8]),
                "Replaced existing snapshot"
            );
        }
        debug!(
            height = block.height(),
            fingerprint = hex::encode(&fingerprint[..8]),
            linked = pre.is_some(),
            tracked = arena.len(),
            "Created snapshot"
        );
        snapshot
    }

    /// Retire the snapshot of a committed block.
    ///
    /// Removes it under both fingerprints, unlinks its children and evicts
    /// everything older than the GC horizon. Calling it twice for the same
    /// block is a no-op the second time.
    pub fn notify_block_committed(&self, block: &Block) -> SnapshotResult<()> {
        let height = block.height();
        let fingerprint = block.fingerprint();
        let non_consensus = block.non_consensus_fingerprint();

        let mut arena = self.arena.write();
        let mut retired = Vec::with_capacity(2);
        for fp in [fingerprint, non_consensus] {
            if arena.remove(&fp).is_some() {
                retired.push(fp);
            }
        }
        if !retired.contains(&fingerprint) {
            retired.push(fingerprint);
        }

        let horizon = self.config.gc_horizon;
        let stale: Vec<Fingerprint> = arena
            .iter()
            .filter(|(_, s)| height.saturating_sub(s.block_height()) > horizon)
            .map(|(fp, _)| *fp)
            .collect();
        for fp in &stale {
            arena.remove(fp);
        }
        retired.extend(stale.iter().copied());

        for snapshot in arena.values() {
            if let Some(pre) = snapshot.pre_snapshot() {
                if retired.contains(&pre) {
                    snapshot.set_pre_snapshot(None);
                }
            }
        }

        self.committed_height.fetch_max(height, Ordering::SeqCst);
        info!(
            height,
            fingerprint = hex::encode(&fingerprint[..8]),
            evicted = stale.len(),
            tracked = arena.len(),
            "Snapshot retired"
        );
        Ok(())
    }

    /// Tracked snapshot for `block`.
    pub fn get_snapshot(&self, block: &Block) -> Option<Arc<Snapshot>> {
        self.arena.read().get(&block.fingerprint()).cloned()
    }

    /// Highest height passed to
    /// [`notify_block_committed`](Self::notify_block_committed).
    pub fn committed_height(&self) -> u64 {
        self.committed_height.load(Ordering::SeqCst)
    }

    /// Number of tracked snapshots.
    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    /// Whether no snapshot is tracked.
    pub fn is_empty(&self) -> bool {
        self.arena.read().is_empty()
    }
}
