//! End-to-end tests for the chained-HotStuff state machine.
//!
//! A small in-process cluster routes [`SmrAction`]s between validators so
//! that proposals, votes, view changes, block fetch and commits run exactly
//! as they would between engines, minus the network and timers.

use std::collections::VecDeque;
use std::sync::Arc;

use hotchain_consensus::{
    BlockSignatureVerifier, ChainStore, ChainedBftSmr, ConsensusPayload, ConsensusWal,
    ProposalData, SmrAction, SmrConfig, SmrDeps, SmrError, StaticGovernance, WalConfig,
};
use hotchain_core::{
    BlockCommitter, BlockResult, BlockVerifier, BlockchainStore, KeyAccessControl,
    KeySigningMember, LedgerCache, MemoryBlockchainStore, MemoryLedgerCache, ProposeState,
    SigningMember, VerifyMode,
};
use hotchain_crypto::ecdsa::PrivateKey;
use hotchain_types::{Block, BlockHeader};
use parking_lot::Mutex;
use tempfile::TempDir;

struct AcceptAll;

impl BlockVerifier for AcceptAll {
    fn verify_block(&self, _block: &Block, _mode: VerifyMode) -> BlockResult<()> {
        Ok(())
    }
}

struct RecordingCommitter {
    store: Arc<MemoryBlockchainStore>,
    ledger: Arc<MemoryLedgerCache>,
    committed: Mutex<Vec<Block>>,
}

impl BlockCommitter for RecordingCommitter {
    fn add_block(&self, block: &Block) -> BlockResult<()> {
        self.store.put_block(block, &[])?;
        self.ledger.set_last_committed_block(block.clone());
        self.committed.lock().push(block.clone());
        Ok(())
    }
}

impl RecordingCommitter {
    fn heights(&self) -> Vec<u64> {
        self.committed.lock().iter().map(Block::height).collect()
    }
}

struct Node {
    smr: ChainedBftSmr,
    signer: Arc<KeySigningMember>,
    committer: Arc<RecordingCommitter>,
    store: Arc<MemoryBlockchainStore>,
    ledger: Arc<MemoryLedgerCache>,
    wal_dir: TempDir,
}

struct Cluster {
    nodes: Vec<Node>,
    governance: Arc<StaticGovernance>,
    ac: Arc<KeyAccessControl>,
}

type Queue = VecDeque<(usize, SmrAction)>;

fn child(parent: &Block, timestamp: i64, proposer: Option<&KeySigningMember>) -> Block {
    Block::new(
        BlockHeader {
            chain_id: "test".into(),
            block_height: parent.height() + 1,
            pre_block_hash: parent.hash(),
            block_timestamp: timestamp,
            proposer: proposer.map(|s| s.member()),
            ..Default::default()
        },
        Vec::new(),
    )
}

fn open_smr(
    node_id: String,
    signer: Arc<KeySigningMember>,
    ac: Arc<KeyAccessControl>,
    governance: Arc<StaticGovernance>,
    committer: Arc<RecordingCommitter>,
    store: Arc<MemoryBlockchainStore>,
    ledger: Arc<MemoryLedgerCache>,
    wal_dir: &TempDir,
) -> ChainedBftSmr {
    let wal = ConsensusWal::open(WalConfig {
        dir: wal_dir.path().to_path_buf(),
        sync_on_write: false,
        strict_recovery: false,
    })
    .unwrap();
    let chain = ChainStore::open(ledger, committer, store, 16).unwrap();
    ChainedBftSmr::new(
        SmrDeps {
            node_id,
            signer,
            ac,
            verifier: Arc::new(AcceptAll),
            governance,
            wal: Arc::new(wal),
        },
        SmrConfig::default(),
        chain,
    )
    .unwrap()
}

/// `n` validators sharing a committed chain up to `tip_height`.
fn create_test_validators(n: usize, tip_height: u64, epoch_length: u64) -> Cluster {
    let signers: Vec<_> = (0..n)
        .map(|i| Arc::new(KeySigningMember::new(format!("org{i}"), PrivateKey::random())))
        .collect();
    let governance = Arc::new(StaticGovernance::new(
        signers
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("node-{i}"), s.member()))
            .collect(),
        epoch_length,
    ));
    let ac = Arc::new(KeyAccessControl::new());

    let mut chain = vec![Block::genesis("test")];
    for height in 1..=tip_height {
        let parent = &chain[height as usize - 1];
        chain.push(child(parent, height as i64, None));
    }

    let nodes = signers
        .into_iter()
        .enumerate()
        .map(|(i, signer)| {
            let store = Arc::new(MemoryBlockchainStore::with_genesis(&chain[0]).unwrap());
            for block in &chain[1..] {
                store.put_block(block, &[]).unwrap();
            }
            let ledger = Arc::new(MemoryLedgerCache::new(chain.last().cloned()));
            let committer = Arc::new(RecordingCommitter {
                store: store.clone(),
                ledger: ledger.clone(),
                committed: Mutex::new(Vec::new()),
            });
            let wal_dir = TempDir::new().unwrap();
            let smr = open_smr(
                format!("node-{i}"),
                signer.clone(),
                ac.clone(),
                governance.clone(),
                committer.clone(),
                store.clone(),
                ledger.clone(),
                &wal_dir,
            );
            Node {
                smr,
                signer,
                committer,
                store,
                ledger,
                wal_dir,
            }
        })
        .collect();

    Cluster {
        nodes,
        governance,
        ac,
    }
}

impl Cluster {
    fn start(&mut self) -> Queue {
        let mut queue = Queue::new();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            queue.extend(node.smr.start().into_iter().map(|a| (i, a)));
        }
        queue
    }

    fn build_block(&self, node: usize, state: &ProposeState) -> Block {
        let parent = self.nodes[node]
            .smr
            .chain_store()
            .get(&state.pre_block_hash)
            .map(|entry| entry.block.clone())
            .unwrap();
        assert_eq!(parent.height() + 1, state.height);
        child(&parent, 1_000 + state.level as i64, Some(&self.nodes[node].signer))
    }

    fn deliver(&mut self, to: usize, payload: ConsensusPayload) -> Result<Vec<SmrAction>, SmrError> {
        let smr = &mut self.nodes[to].smr;
        match payload {
            ConsensusPayload::Proposal(p) => smr.process_proposal(p),
            ConsensusPayload::Vote(v) => smr.process_vote(v),
            ConsensusPayload::BlockFetch(m) => smr.process_block_fetch(m),
            ConsensusPayload::BlockFetchResp(m) => smr.process_fetch_resp(m),
        }
    }

    /// Route actions until `done` holds or the queue drains. `drop` filters
    /// deliveries `(to, payload)`.
    fn pump(
        &mut self,
        mut queue: Queue,
        max_steps: usize,
        mut drop: impl FnMut(usize, &ConsensusPayload) -> bool,
        done: impl Fn(&Cluster) -> bool,
    ) -> Queue {
        let mut steps = 0;
        while let Some((origin, action)) = queue.pop_front() {
            if done(self) || steps >= max_steps {
                queue.push_front((origin, action));
                break;
            }
            steps += 1;
            let mut targets = Vec::new();
            match action {
                SmrAction::Broadcast(payload) => {
                    for to in (0..self.nodes.len()).filter(|&to| to != origin) {
                        targets.push((to, payload.clone()));
                    }
                }
                SmrAction::SendTo { to, payload } => targets.push((to as usize, payload)),
                SmrAction::RequestProposal(state) => {
                    let block = self.build_block(origin, &state);
                    if let Ok(actions) = self.nodes[origin].smr.process_proposed_block(block) {
                        queue.extend(actions.into_iter().map(|a| (origin, a)));
                    }
                }
                SmrAction::ScheduleTimer(_) => {}
            }
            for (to, payload) in targets {
                if drop(to, &payload) {
                    continue;
                }
                if let Ok(actions) = self.deliver(to, payload) {
                    queue.extend(actions.into_iter().map(|a| (to, a)));
                }
            }
        }
        queue
    }

    fn all_committed(&self, height: u64) -> bool {
        self.nodes
            .iter()
            .all(|n| n.smr.chain_store().get_commit_height() >= height)
    }
}

fn take_proposal(actions: &[SmrAction]) -> ProposalData {
    actions
        .iter()
        .find_map(|a| match a {
            SmrAction::Broadcast(ConsensusPayload::Proposal(p)) => Some(p.clone()),
            _ => None,
        })
        .unwrap()
}

fn take_vote_to(actions: &[SmrAction], target: u32) -> hotchain_consensus::Vote {
    actions
        .iter()
        .find_map(|a| match a {
            SmrAction::SendTo {
                to,
                payload: ConsensusPayload::Vote(v),
            } if *to == target => Some(v.clone()),
            _ => None,
        })
        .unwrap()
}

#[test]
fn test_quorum_advances_height_and_three_chain_commits() {
    let mut cluster = create_test_validators(4, 9, 0);
    let queue = cluster.start();

    // round robin: level 1 belongs to validator 1
    let requests: Vec<_> = queue
        .iter()
        .filter_map(|(i, a)| match a {
            SmrAction::RequestProposal(state) => Some((*i, state.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 1);
    let (proposer, state) = requests[0].clone();
    assert_eq!(proposer, 1);
    assert_eq!((state.height, state.level), (10, 1));

    let block = cluster.build_block(1, &state);
    let b10 = block.hash();
    let actions = cluster.nodes[1].smr.process_proposed_block(block).unwrap();
    let proposal = take_proposal(&actions);
    // votes go to the proposer of (11, 2)
    let vote_a = take_vote_to(&actions, 2);

    let vote_b = take_vote_to(&cluster.deliver(0, ConsensusPayload::Proposal(proposal.clone())).unwrap(), 2);
    let vote_c = take_vote_to(&cluster.deliver(3, ConsensusPayload::Proposal(proposal.clone())).unwrap(), 2);

    // validator 2 is the next proposer and votes locally
    let actions = cluster
        .deliver(2, ConsensusPayload::Proposal(proposal))
        .unwrap();
    assert!(actions
        .iter()
        .all(|a| !matches!(a, SmrAction::SendTo { payload: ConsensusPayload::Vote(_), .. })));
    assert_eq!(cluster.nodes[2].smr.round_state().height, 10);

    assert!(cluster.deliver(2, ConsensusPayload::Vote(vote_a)).unwrap().is_empty());
    let actions = cluster.deliver(2, ConsensusPayload::Vote(vote_b)).unwrap();

    let round = cluster.nodes[2].smr.round_state();
    assert_eq!((round.height, round.level), (11, 2));
    assert_eq!(cluster.nodes[2].smr.chain_store().get_current_qc().block_id, b10);
    assert!(actions.iter().any(|a| matches!(
        a,
        SmrAction::RequestProposal(ProposeState { height: 11, level: 2, .. })
    )));
    assert!(cluster.nodes[2].committer.heights().is_empty());

    // a late fourth vote neither moves the round nor errors
    assert!(cluster.deliver(2, ConsensusPayload::Vote(vote_c)).unwrap().is_empty());
    assert_eq!(cluster.nodes[2].smr.round_state().level, 2);

    // drive two more QCs; the third commits height 10 everywhere
    let queue: Queue = actions.into_iter().map(|a| (2, a)).collect();
    cluster.pump(queue, 10_000, |_, _| false, |c| c.all_committed(10));

    for node in &cluster.nodes {
        let committed = node.committer.committed.lock();
        assert_eq!(committed[0].height(), 10);
        assert_eq!(committed[0].hash(), b10);
        assert!(node.smr.round_state().height >= 13);
    }

    let stored = cluster.nodes[0].store.get_block(10).unwrap().unwrap();
    let verifier = BlockSignatureVerifier::new(cluster.nodes[0].smr.epochs(), cluster.ac.clone());
    let qc = verifier.verify_block_signatures(&stored).unwrap();
    assert_eq!(qc.level, 1);
    assert!(qc.votes.len() >= 3);
}

#[test]
fn test_qc_formed_before_its_block_is_applied_on_arrival() {
    let mut cluster = create_test_validators(4, 9, 0);
    let queue = cluster.start();
    let state = queue
        .iter()
        .find_map(|(_, a)| match a {
            SmrAction::RequestProposal(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    let block = cluster.build_block(1, &state);
    let b10 = block.hash();
    let actions = cluster.nodes[1].smr.process_proposed_block(block).unwrap();
    let proposal = take_proposal(&actions);
    let vote_1 = take_vote_to(&actions, 2);
    let vote_0 = take_vote_to(&cluster.deliver(0, ConsensusPayload::Proposal(proposal.clone())).unwrap(), 2);
    let vote_3 = take_vote_to(&cluster.deliver(3, ConsensusPayload::Proposal(proposal.clone())).unwrap(), 2);

    // validator 2 certifies height 10 before it has the block
    assert!(cluster.deliver(2, ConsensusPayload::Vote(vote_1)).unwrap().is_empty());
    assert!(cluster.deliver(2, ConsensusPayload::Vote(vote_0)).unwrap().is_empty());
    let actions = cluster.deliver(2, ConsensusPayload::Vote(vote_3)).unwrap();
    let fetch = actions
        .iter()
        .find_map(|a| match a {
            SmrAction::SendTo {
                to: 3,
                payload: ConsensusPayload::BlockFetch(m),
            } => Some(m.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(fetch.block_id, b10);
    assert_eq!(cluster.nodes[2].smr.round_state().height, 10);

    // the proposal brings the block and the parked QC applies
    let actions = cluster
        .deliver(2, ConsensusPayload::Proposal(proposal))
        .unwrap();
    let round = cluster.nodes[2].smr.round_state();
    assert_eq!((round.height, round.level), (11, 2));
    assert_eq!(cluster.nodes[2].smr.chain_store().get_current_qc().block_id, b10);
    assert!(actions.iter().any(|a| matches!(
        a,
        SmrAction::RequestProposal(ProposeState { height: 11, level: 2, .. })
    )));

    // validator 3 holds no certified copy, so the late answer is empty
    let resp = cluster.deliver(3, ConsensusPayload::BlockFetch(fetch)).unwrap();
    let resp = resp
        .into_iter()
        .find_map(|a| match a {
            SmrAction::SendTo {
                to: 2,
                payload: ConsensusPayload::BlockFetchResp(m),
            } => Some(m),
            _ => None,
        })
        .unwrap();
    assert!(resp.blocks.is_empty());
    assert!(cluster
        .deliver(2, ConsensusPayload::BlockFetchResp(resp))
        .unwrap()
        .is_empty());
    assert_eq!(cluster.nodes[2].smr.round_state().height, 11);
}

#[test]
fn test_cluster_keeps_committing() {
    let mut cluster = create_test_validators(4, 0, 0);
    let queue = cluster.start();
    cluster.pump(queue, 50_000, |_, _| false, |c| c.all_committed(6));

    let reference: Vec<_> = cluster.nodes[0]
        .committer
        .committed
        .lock()
        .iter()
        .map(Block::hash)
        .collect();
    assert!(reference.len() >= 6);
    for node in &cluster.nodes[1..] {
        let hashes: Vec<_> = node.committer.committed.lock().iter().map(Block::hash).collect();
        let common = hashes.len().min(reference.len());
        assert_eq!(hashes[..common], reference[..common]);
        assert_eq!(node.committer.heights()[..6], [1, 2, 3, 4, 5, 6]);
    }
}

#[test]
fn test_single_validator_commits_alone() {
    let mut cluster = create_test_validators(1, 0, 0);
    let queue = cluster.start();
    cluster.pump(queue, 1_000, |_, _| false, |c| c.all_committed(3));
    assert_eq!(cluster.nodes[0].committer.heights()[..3], [1, 2, 3]);
}

#[test]
fn test_duplicate_proposal_rejected_as_already_voted() {
    let mut cluster = create_test_validators(4, 9, 0);
    let queue = cluster.start();
    let state = queue
        .iter()
        .find_map(|(_, a)| match a {
            SmrAction::RequestProposal(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    let block = cluster.build_block(1, &state);
    let proposal = take_proposal(&cluster.nodes[1].smr.process_proposed_block(block).unwrap());

    cluster.deliver(0, ConsensusPayload::Proposal(proposal.clone())).unwrap();
    assert_eq!(cluster.nodes[0].smr.safety().last_voted_level(), 1);
    assert!(matches!(
        cluster.deliver(0, ConsensusPayload::Proposal(proposal)),
        Err(SmrError::AlreadyVoted { height: 10, level: 1 })
    ));
}

#[test]
fn test_proposal_from_wrong_proposer_rejected() {
    let mut cluster = create_test_validators(4, 9, 0);
    cluster.start();
    let tip = cluster.nodes[0].ledger.get_last_committed_block().unwrap();

    let mut proposal = ProposalData {
        block: child(&tip, 5, Some(&cluster.nodes[3].signer)),
        height: 10,
        level: 1,
        epoch_id: 0,
        proposer_idx: 3,
        justify_qc: cluster.nodes[0].smr.chain_store().get_current_qc().clone(),
        endorsement: None,
    };
    proposal.sign(cluster.nodes[3].signer.as_ref()).unwrap();

    assert!(matches!(
        cluster.deliver(0, ConsensusPayload::Proposal(proposal)),
        Err(SmrError::WrongProposer { expected: 1, got: 3, .. })
    ));
    assert_eq!(cluster.nodes[0].smr.safety().last_voted_level(), 0);
}

#[test]
fn test_proposal_with_mismatched_justify_rejected() {
    let mut cluster = create_test_validators(4, 9, 0);
    cluster.start();
    let tip = cluster.nodes[0].ledger.get_last_committed_block().unwrap();
    let parent = cluster.nodes[0].store.get_block(8).unwrap().unwrap();

    let mut proposal = ProposalData {
        block: child(&tip, 5, Some(&cluster.nodes[1].signer)),
        height: 10,
        level: 1,
        epoch_id: 0,
        proposer_idx: 1,
        justify_qc: hotchain_consensus::QuorumCert::genesis(&parent, 0),
        endorsement: None,
    };
    proposal.sign(cluster.nodes[1].signer.as_ref()).unwrap();

    assert!(matches!(
        cluster.deliver(0, ConsensusPayload::Proposal(proposal)),
        Err(SmrError::InvalidProposal { height: 10, level: 1, .. })
    ));
}

#[test]
fn test_timeouts_form_new_view_qc() {
    let mut cluster = create_test_validators(4, 9, 0);
    let queue = cluster.start();
    let timers: Vec<_> = queue
        .iter()
        .filter_map(|(i, a)| match a {
            SmrAction::ScheduleTimer(event) => Some((*i, *event)),
            _ => None,
        })
        .collect();
    assert_eq!(timers.len(), 4);

    // a timer for an older level is ignored
    let mut stale = timers[0].1;
    stale.level = 0;
    assert!(cluster.nodes[0].smr.process_local_timeout(stale).unwrap().is_empty());

    let mut queue = Queue::new();
    for (i, event) in timers {
        let actions = cluster.nodes[i].smr.process_local_timeout(event).unwrap();
        assert!(actions.iter().any(|a| matches!(
            a,
            SmrAction::Broadcast(ConsensusPayload::Vote(v)) if v.new_view && v.level == 1
        )));
        queue.extend(actions.into_iter().map(|a| (i, a)));
    }
    // stop before anyone proposes at the new level
    let leftover = cluster.pump(
        queue,
        10_000,
        |_, p| matches!(p, ConsensusPayload::Proposal(_)),
        |c| c.nodes.iter().all(|n| n.smr.round_state().level == 2),
    );

    for node in &cluster.nodes {
        let round = node.smr.round_state();
        assert_eq!((round.height, round.level), (10, 2));
        assert_eq!(node.smr.safety().last_voted_level(), 1);
    }

    // the view change leaves the chain live
    cluster.pump(leftover, 50_000, |_, _| false, |c| c.all_committed(10));
    assert!(cluster.all_committed(10));
}

#[test]
fn test_lagging_validator_fetches_missing_parent() {
    let mut cluster = create_test_validators(4, 9, 0);
    let queue = cluster.start();
    let mut dropped = 0;
    cluster.pump(
        queue,
        50_000,
        |to, p| {
            let skip = to == 3
                && matches!(p, ConsensusPayload::Proposal(prop) if prop.height == 10);
            if skip {
                dropped += 1;
            }
            skip
        },
        |c| c.all_committed(11),
    );
    assert_eq!(dropped, 1);
    assert!(cluster.all_committed(11));
    let lagging = cluster.nodes[3].committer.heights();
    assert_eq!(lagging[..2], [10, 11]);
}

#[test]
fn test_replay_restores_vote_safety() {
    let mut cluster = create_test_validators(4, 9, 0);
    let queue = cluster.start();
    let state = queue
        .iter()
        .find_map(|(_, a)| match a {
            SmrAction::RequestProposal(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    let block = cluster.build_block(1, &state);
    let proposal = take_proposal(&cluster.nodes[1].smr.process_proposed_block(block).unwrap());
    cluster.deliver(0, ConsensusPayload::Proposal(proposal.clone())).unwrap();

    // restart validator 0 on the same WAL
    let node = cluster.nodes.remove(0);
    let Node {
        smr,
        signer,
        committer,
        store,
        ledger,
        wal_dir,
    } = node;
    drop(smr);
    let mut smr = open_smr(
        "node-0".into(),
        signer,
        cluster.ac.clone(),
        cluster.governance.clone(),
        committer,
        store,
        ledger,
        &wal_dir,
    );
    let records = {
        let reopened = ConsensusWal::open(WalConfig {
            dir: wal_dir.path().to_path_buf(),
            sync_on_write: false,
            strict_recovery: false,
        })
        .unwrap();
        reopened.replay_wal().unwrap()
    };
    assert_eq!(records.len(), 2);
    smr.replay(records);

    assert_eq!(smr.safety().last_voted_level(), 1);
    assert!(smr.chain_store().contains(&proposal.block.hash()));
    assert!(matches!(
        smr.process_proposal(proposal),
        Err(SmrError::AlreadyVoted { .. })
    ));
}

#[test]
fn test_epoch_switch_after_boundary_commit() {
    let mut cluster = create_test_validators(4, 9, 10);
    cluster.start();
    assert_eq!(cluster.nodes[0].smr.epoch().epoch_id, 0);
    assert_eq!(cluster.nodes[0].smr.epoch().next_switch_height, 10);

    let tip = cluster.nodes[0].ledger.get_last_committed_block().unwrap();
    let b10 = child(&tip, 10, Some(&cluster.nodes[1].signer));
    let actions = cluster.nodes[0].smr.process_block_committed(&b10).unwrap();

    let epochs = cluster.nodes[0].smr.epochs();
    assert_eq!(epochs.read().current.epoch_id, 1);
    assert_eq!(epochs.read().previous.as_ref().map(|e| e.epoch_id), Some(0));
    assert_eq!(cluster.nodes[0].smr.round_state().epoch_id, 1);
    assert!(actions
        .iter()
        .any(|a| matches!(a, SmrAction::ScheduleTimer(e) if e.epoch_id == 1)));

    // committing below the boundary again changes nothing
    let actions = cluster.nodes[0].smr.process_block_committed(&tip).unwrap();
    assert!(actions.is_empty());
}
