//! Snapshot manager lifecycle: chaining, commit notification and GC.

use std::sync::Arc;

use hotchain_core::MemoryBlockchainStore;
use hotchain_snapshot::{ManagerConfig, SimContext, SnapshotManager, SpecialTxType};
use hotchain_types::{Block, BlockHeader, Member, Transaction};

fn child(parent: &Block, proposer: Option<Member>) -> Block {
    Block::new(
        BlockHeader {
            chain_id: "mgr-test".into(),
            block_height: parent.height() + 1,
            pre_block_hash: parent.hash(),
            block_timestamp: parent.height() as i64 + 1,
            proposer,
            ..Default::default()
        },
        vec![],
    )
}

fn proposer() -> Option<Member> {
    Some(Member::new("org1", vec![1, 2, 3]))
}

fn chain(len: u64) -> Vec<Block> {
    let mut blocks = vec![Block::genesis("mgr-test")];
    for _ in 0..len {
        let next = child(blocks.last().unwrap(), proposer());
        blocks.push(next);
    }
    blocks
}

fn setup() -> (SnapshotManager, Arc<MemoryBlockchainStore>) {
    let store = Arc::new(MemoryBlockchainStore::new());
    let mgr = SnapshotManager::new(store.clone(), ManagerConfig::default());
    (mgr, store)
}

#[test]
fn test_commit_notification_is_idempotent() {
    let (mgr, _store) = setup();
    let blocks = chain(3);
    for pair in blocks.windows(2) {
        mgr.new_snapshot(&pair[0], &pair[1]);
    }
    assert_eq!(mgr.len(), 3);

    mgr.notify_block_committed(&blocks[1]).unwrap();
    let after_once: Vec<_> = blocks[1..]
        .iter()
        .map(|b| mgr.get_snapshot(b).map(|s| s.pre_snapshot()))
        .collect();

    mgr.notify_block_committed(&blocks[1]).unwrap();
    let after_twice: Vec<_> = blocks[1..]
        .iter()
        .map(|b| mgr.get_snapshot(b).map(|s| s.pre_snapshot()))
        .collect();

    assert_eq!(after_once, after_twice);
    assert_eq!(mgr.len(), 2);
    assert_eq!(after_once[0], None);
    assert_eq!(after_once[1], Some(None));
    assert_eq!(after_once[2], Some(Some(blocks[2].fingerprint())));
}

#[test]
fn test_committed_ancestor_reads_fall_through_to_store() {
    let (mgr, store) = setup();
    let blocks = chain(2);
    let s1 = mgr.new_snapshot(&blocks[0], &blocks[1]);
    let mut ctx = SimContext::new(Transaction::invoke("tx1", "kv", "set"), 0);
    ctx.put("kv", b"k", b"pending".to_vec());
    assert!(s1
        .apply_tx_sim_context(&ctx, SpecialTxType::None, true, false)
        .is_applied());
    let s2 = mgr.new_snapshot(&blocks[1], &blocks[2]);
    assert_eq!(s2.get_key(0, "kv", b"k").unwrap(), Some(b"pending".to_vec()));

    // the committer persisted block 1's writes
    store.put_object("kv", b"k", b"durable".to_vec());
    mgr.notify_block_committed(&blocks[1]).unwrap();
    assert_eq!(s2.get_key(0, "kv", b"k").unwrap(), Some(b"durable".to_vec()));
}

#[test]
fn test_gc_evicts_beyond_horizon() {
    let (mgr, _store) = setup();
    let blocks = chain(12);
    let forked = child(&blocks[1], Some(Member::new("org2", vec![9])));
    mgr.new_snapshot(&blocks[1], &forked);
    mgr.new_snapshot(&blocks[10], &blocks[11]);
    assert_eq!(mgr.len(), 2);

    // 10 - 2 = 8 is still within the horizon
    mgr.notify_block_committed(&blocks[10]).unwrap();
    assert!(mgr.get_snapshot(&forked).is_some());

    mgr.notify_block_committed(&blocks[11]).unwrap();
    assert!(mgr.get_snapshot(&forked).is_none());
    assert!(mgr.is_empty());
    assert_eq!(mgr.committed_height(), 11);
}

#[test]
fn test_custom_horizon() {
    let store = Arc::new(MemoryBlockchainStore::new());
    let mgr = SnapshotManager::new(
        store,
        ManagerConfig {
            gc_horizon: 1,
            ..ManagerConfig::default()
        },
    );
    let blocks = chain(4);
    let stale = child(&blocks[1], Some(Member::new("org2", vec![9])));
    mgr.new_snapshot(&blocks[1], &stale);

    mgr.notify_block_committed(&blocks[4]).unwrap();
    assert!(mgr.is_empty());
}

#[test]
fn test_gc_unlinks_children_of_evicted_snapshots() {
    let (mgr, _store) = setup();
    let blocks = chain(12);
    let fork2 = child(&blocks[1], Some(Member::new("org2", vec![9])));
    let fork3 = child(&fork2, Some(Member::new("org2", vec![9])));
    mgr.new_snapshot(&blocks[1], &fork2);
    let s3 = mgr.new_snapshot(&fork2, &fork3);
    assert_eq!(s3.pre_snapshot(), Some(fork2.fingerprint()));

    mgr.notify_block_committed(&blocks[11]).unwrap();
    assert!(mgr.get_snapshot(&fork2).is_none());
    assert!(mgr.get_snapshot(&fork3).is_some());
    assert_eq!(s3.pre_snapshot(), None);
}

#[test]
fn test_commit_removes_proposerless_duplicate() {
    let (mgr, _store) = setup();
    let genesis = Block::genesis("mgr-test");
    let synced = child(&genesis, None);
    let mut proposed = synced.clone();
    proposed.header.proposer = proposer();

    mgr.new_snapshot(&genesis, &synced);
    mgr.new_snapshot(&genesis, &proposed);
    assert_eq!(mgr.len(), 2);

    mgr.notify_block_committed(&proposed).unwrap();
    assert!(mgr.is_empty());
}

#[test]
fn test_commit_of_untracked_block_is_harmless() {
    let (mgr, _store) = setup();
    let blocks = chain(2);
    mgr.new_snapshot(&blocks[1], &blocks[2]);
    mgr.notify_block_committed(&blocks[1]).unwrap();
    assert_eq!(mgr.len(), 1);
    assert_eq!(mgr.get_snapshot(&blocks[2]).unwrap().pre_snapshot(), None);
}
