//! End-to-end devnet runs: consensus, parallel execution and commit.

use std::time::Duration;

use hotchain_config::Config;
use hotchain_core::BlockchainStore;
use hotchain_node::block_builder::DEVNET_ACCOUNTS;
use hotchain_node::executor::{decode_balance, BANK_CONTRACT, INITIAL_BALANCE};
use hotchain_node::Devnet;
use tempfile::TempDir;

fn devnet_config(validators: usize, wal_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.chain.chain_id = "devnet-test".into();
    config.devnet.validator_count = validators;
    config.devnet.txs_per_block = 8;
    config.consensus.base_timeout_ms = 400;
    config.consensus.timeout_delta_ms = 100;
    config.consensus.max_timeout_ms = 3_000;
    config.consensus.wal.dir = wal_dir.path().to_path_buf();
    config.consensus.wal.sync_on_write = false;
    config
}

async fn wait_for_height(devnet: &Devnet, height: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while tokio::time::Instant::now() < deadline {
        if devnet.min_commit_height() >= height {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn balances(store: &dyn BlockchainStore) -> Vec<u64> {
    (0..DEVNET_ACCOUNTS)
        .map(|i| {
            let raw = store
                .read_object(BANK_CONTRACT, format!("acct{i}").as_bytes())
                .unwrap();
            decode_balance(raw.as_deref()).unwrap()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_validator_devnet_commits() {
    let wal_dir = TempDir::new().unwrap();
    let devnet = Devnet::new(&devnet_config(1, &wal_dir)).unwrap();
    devnet.start().await.unwrap();
    assert!(wait_for_height(&devnet, 3).await, "devnet stalled");
    devnet.stop().await;

    let node = &devnet.nodes()[0];
    let block = node.store.get_block(2).unwrap().unwrap();
    assert_eq!(block.txs.len(), 8);
    assert_eq!(block.dag.vertexes.len(), 8);
    assert!(block.qc_bytes().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_validators_share_state() {
    let wal_dir = TempDir::new().unwrap();
    let devnet = Devnet::new(&devnet_config(4, &wal_dir)).unwrap();
    devnet.start().await.unwrap();
    assert!(wait_for_height(&devnet, 3).await, "devnet stalled");
    devnet.stop().await;

    let nodes = devnet.nodes();
    let common = nodes
        .iter()
        .map(|n| n.store.get_last_block().unwrap().unwrap().height())
        .min()
        .unwrap();
    assert!(common >= 3);

    // compare at a height every store has reached
    let reference = nodes[0].store.get_block(common).unwrap().unwrap();
    for node in &nodes[1..] {
        let block = node.store.get_block(common).unwrap().unwrap();
        assert_eq!(block.hash(), reference.hash(), "fork at {}", node.node_id);
        assert_eq!(block.dag, reference.dag);
    }

    let total: u64 = balances(nodes[0].store.as_ref()).iter().sum();
    assert_eq!(total, DEVNET_ACCOUNTS as u64 * INITIAL_BALANCE);
}

#[test]
fn test_configured_validators_need_private_keys() {
    let wal_dir = TempDir::new().unwrap();
    let mut config = devnet_config(1, &wal_dir);
    let key = hotchain_crypto::PrivateKey::random();
    config.validators.push(hotchain_config::ValidatorEntry {
        node_id: "solo".into(),
        org_id: "org1".into(),
        public_key: key.public_key().to_hex(),
        private_key: None,
    });
    let err = Devnet::new(&config).err().unwrap();
    assert!(err.to_string().contains("solo"));
}
