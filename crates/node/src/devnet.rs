//! In-process devnet: a full validator set sharing one process.
//!
//! Each validator gets its own bus, memory store, snapshot manager and
//! consensus engine. Validators talk over a [`LoopbackHub`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use hotchain_config::{Config, ProposerSelectionMode};
use hotchain_consensus::{
    ChainedBftEngine, ConsensusDeps, EngineConfig, ProposerSelection, StaticGovernance,
    TimeoutConfig, WalConfig,
};
use hotchain_core::{
    KeyAccessControl, KeySigningMember, MemoryBlockchainStore, MemoryLedgerCache, MsgBus,
    SigningMember, Topic,
};
use hotchain_crypto::PrivateKey;
use hotchain_snapshot::{ManagerConfig, SnapshotManager};
use hotchain_types::Block;
use tracing::{info, warn};

use crate::block_builder::BlockBuilder;
use crate::committer::LedgerCommitter;
use crate::executor::BlockExecutor;
use crate::network::LoopbackHub;
use crate::verifier::ExecutingVerifier;

/// One validator of the devnet.
pub struct DevnetNode {
    /// Routing id
    pub node_id: String,
    /// Consensus engine
    pub engine: Arc<ChainedBftEngine>,
    /// Committed blocks and state
    pub store: Arc<MemoryBlockchainStore>,
    /// Execution over the snapshot chain
    pub executor: Arc<BlockExecutor>,
}

/// A running set of in-process validators.
pub struct Devnet {
    nodes: Vec<DevnetNode>,
    hub: Arc<LoopbackHub>,
    stop_height: u64,
}

struct ValidatorKey {
    node_id: String,
    org_id: String,
    key: PrivateKey,
}

fn validator_keys(config: &Config) -> Result<Vec<ValidatorKey>> {
    if config.validators.is_empty() {
        return Ok((0..config.devnet.validator_count)
            .map(|i| ValidatorKey {
                node_id: format!("node{i}"),
                org_id: format!("org{i}"),
                key: PrivateKey::random(),
            })
            .collect());
    }
    config
        .validators
        .iter()
        .map(|v| {
            let key = v
                .parsed_private_key()?
                .ok_or_else(|| anyhow!("validator {} has no private_key", v.node_id))?;
            Ok(ValidatorKey {
                node_id: v.node_id.clone(),
                org_id: v.org_id.clone(),
                key,
            })
        })
        .collect()
}

fn engine_config(config: &Config, node_id: &str) -> EngineConfig {
    let consensus = &config.consensus;
    EngineConfig {
        timeouts: TimeoutConfig {
            base: consensus.base_timeout(),
            delta: consensus.timeout_delta(),
            max: consensus.max_timeout(),
        },
        channel_capacity: consensus.channel_capacity,
        selection: match consensus.proposer_selection {
            ProposerSelectionMode::RoundRobin => ProposerSelection::RoundRobin,
            ProposerSelectionMode::Shuffled => ProposerSelection::Shuffled,
        },
        chain_store_retention: consensus.chain_store_retention,
        fetch_batch_size: consensus.fetch_batch_size,
        wal: WalConfig {
            dir: consensus.wal.dir.join(node_id),
            sync_on_write: consensus.wal.sync_on_write,
            ..WalConfig::default()
        },
    }
}

impl Devnet {
    /// Wire every validator described by `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let chain_id = config.chain.chain_id.clone();
        let keys = validator_keys(config)?;
        if keys.is_empty() {
            bail!("devnet needs at least one validator");
        }

        let signers: Vec<(String, Arc<KeySigningMember>)> = keys
            .into_iter()
            .map(|v| (v.node_id, Arc::new(KeySigningMember::new(v.org_id, v.key))))
            .collect();
        let governance = Arc::new(
            StaticGovernance::new(
                signers
                    .iter()
                    .map(|(id, s)| (id.clone(), s.member()))
                    .collect(),
                config.governance.epoch_length,
            )
            .with_min_quorum(config.governance.min_quorum)
            .with_timeouts(
                config.consensus.base_timeout_ms,
                config.consensus.timeout_delta_ms,
            ),
        );
        let ac = Arc::new(KeyAccessControl::with_trusted(
            signers.iter().map(|(_, s)| s.member()),
        ));
        let manager_config = ManagerConfig {
            gc_horizon: config.snapshot.gc_horizon,
            legacy_read_version_threshold: config.snapshot.legacy_read_version_threshold,
        };

        let genesis = Block::genesis(chain_id.clone());
        let hub = LoopbackHub::new();
        let mut nodes = Vec::with_capacity(signers.len());
        for (node_id, signer) in signers {
            let bus = Arc::new(MsgBus::new());
            let store = Arc::new(
                MemoryBlockchainStore::with_genesis(&genesis)
                    .with_context(|| format!("storing genesis for {node_id}"))?,
            );
            let ledger = Arc::new(MemoryLedgerCache::new(Some(genesis.clone())));
            let snapshots = Arc::new(SnapshotManager::new(store.clone(), manager_config));
            let executor = Arc::new(BlockExecutor::new(store.clone(), snapshots));

            bus.register(
                Topic::ProposeState,
                Arc::new(BlockBuilder::new(
                    chain_id.clone(),
                    signer.member(),
                    config.devnet.txs_per_block,
                    executor.clone(),
                    bus.clone(),
                )),
            );
            let net = Arc::new(hub.join(node_id.clone(), bus.clone()));
            let deps = ConsensusDeps {
                node_id: node_id.clone(),
                signer,
                ac: ac.clone(),
                net,
                store: store.clone(),
                ledger: ledger.clone(),
                verifier: Arc::new(ExecutingVerifier::new(chain_id.clone(), executor.clone())),
                committer: Arc::new(LedgerCommitter::new(
                    store.clone(),
                    ledger,
                    executor.clone(),
                    bus.clone(),
                )),
                governance: governance.clone(),
                bus,
            };
            let engine = ChainedBftEngine::new(deps, engine_config(config, &node_id))
                .with_context(|| format!("creating engine for {node_id}"))?;
            nodes.push(DevnetNode {
                node_id,
                engine,
                store,
                executor,
            });
        }

        info!(
            chain_id = %chain_id,
            validators = nodes.len(),
            txs_per_block = config.devnet.txs_per_block,
            "Devnet wired"
        );
        Ok(Self {
            nodes,
            hub,
            stop_height: config.devnet.stop_height,
        })
    }

    /// Validators, in configuration order.
    pub fn nodes(&self) -> &[DevnetNode] {
        &self.nodes
    }

    /// Start every engine.
    pub async fn start(&self) -> Result<()> {
        for node in &self.nodes {
            node.engine
                .start()
                .await
                .with_context(|| format!("starting {}", node.node_id))?;
        }
        info!(validators = self.nodes.len(), "Devnet started");
        Ok(())
    }

    /// Stop every engine and detach it from the hub.
    pub async fn stop(&self) {
        for node in &self.nodes {
            node.engine.stop().await;
            self.hub.leave(&node.node_id);
        }
        info!("Devnet stopped");
    }

    /// Lowest commit height across validators.
    pub fn min_commit_height(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.engine.commit_height())
            .min()
            .unwrap_or_default()
    }

    /// Start, then run until Ctrl-C or the configured stop height.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let mut status = tokio::time::interval(Duration::from_secs(5));
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = status.tick() => {
                    for node in &self.nodes {
                        let round = node.engine.round_state();
                        info!(
                            node = %node.node_id,
                            commit_height = node.engine.commit_height(),
                            height = round.height,
                            level = round.level,
                            snapshots = node.executor.snapshots().len(),
                            "Validator status"
                        );
                    }
                }
                _ = poll.tick() => {
                    if self.stop_height > 0 && self.min_commit_height() >= self.stop_height {
                        info!(height = self.stop_height, "Reached stop height");
                        break;
                    }
                    if self.nodes.iter().any(|n| !n.engine.is_running()) {
                        warn!("A validator engine exited");
                        break;
                    }
                }
            }
        }
        self.stop().await;
        Ok(())
    }
}
