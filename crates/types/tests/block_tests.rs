//! Tests for block encoding and identifiers

use hotchain_types::codec::{self, TX_BATCH_SIZE};
use hotchain_types::{
    Block, BlockHeader, Dag, DagNeighbors, Member, Transaction, TxRWSet, TxRead, TxWrite, TypesError,
};

fn txs(n: usize) -> Vec<Transaction> {
    (0..n)
        .map(|i| Transaction::invoke(format!("tx-{i}"), "asset", "transfer"))
        .collect()
}

fn block_with(n: usize) -> Block {
    Block::new(
        BlockHeader {
            chain_id: "chain1".into(),
            block_height: 7,
            block_timestamp: 42,
            proposer: Some(Member::new("org1", vec![1])),
            ..Default::default()
        },
        txs(n),
    )
}

#[test]
fn test_marshal_preserves_order_across_batches() {
    let input = txs(TX_BATCH_SIZE * 2 + 17);
    let raw = codec::marshal_txs(&input).unwrap();
    assert_eq!(raw.len(), input.len());

    let output = codec::unmarshal_txs(&raw).unwrap();
    assert_eq!(output, input);
}

#[test]
fn test_unmarshal_reports_failing_batch() {
    let mut raw = codec::marshal_txs(&txs(TX_BATCH_SIZE + 5)).unwrap();
    raw[TX_BATCH_SIZE + 1] = vec![0xff];
    let result = codec::unmarshal_txs(&raw);
    assert!(matches!(result, Err(TypesError::Batch { batch: 1, .. })));
}

#[test]
fn test_block_encoding_keeps_hash() {
    let mut block = block_with(3);
    block.set_qc_bytes(vec![1, 2, 3]);
    let bytes = codec::encode_block(&block).unwrap();
    let decoded = codec::decode_block(&bytes).unwrap();
    assert_eq!(decoded, block);
    assert_eq!(decoded.compute_hash(), block.hash());
}

#[test]
fn test_tx_root_depends_on_order() {
    let mut forward = txs(4);
    let root = codec::compute_tx_root(&forward);
    forward.reverse();
    assert_ne!(codec::compute_tx_root(&forward), root);
    assert_eq!(codec::compute_tx_root(&[]), [0u8; 32]);
}

#[test]
fn test_genesis_block() {
    let genesis = Block::genesis("chain1");
    assert_eq!(genesis.height(), 0);
    assert!(genesis.header.proposer.is_none());
    assert_eq!(genesis.fingerprint(), genesis.non_consensus_fingerprint());
}

#[test]
fn test_rw_set_root_and_dag_hash() {
    let set = |id: &str| TxRWSet {
        tx_id: id.to_string(),
        tx_reads: vec![TxRead::new("bank", b"alice".to_vec(), b"10".to_vec())],
        tx_writes: vec![TxWrite::new("bank", b"alice".to_vec(), b"9".to_vec())],
    };
    let root = codec::compute_rw_set_root(&[set("a"), set("b")]).unwrap();
    assert_ne!(root, codec::compute_rw_set_root(&[set("b"), set("a")]).unwrap());
    assert_eq!(codec::compute_rw_set_root(&[]).unwrap(), [0u8; 32]);

    let dag = Dag {
        vertexes: vec![DagNeighbors::default(), DagNeighbors { neighbors: vec![0] }],
    };
    assert_eq!(
        codec::compute_dag_hash(&dag).unwrap(),
        codec::compute_dag_hash(&dag.clone()).unwrap()
    );
    assert_ne!(
        codec::compute_dag_hash(&dag).unwrap(),
        codec::compute_dag_hash(&Dag::default()).unwrap()
    );
}
