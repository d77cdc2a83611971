//! Consensus engine wiring.
//!
//! The engine owns the SMR behind a mutex and runs two tasks:
//!
//! - the dispatcher, which decodes raw peer messages into the protocol and
//!   sync lanes
//! - the SMR loop, which drains the lanes, the timer and internal bus
//!   events in priority order (proposal/vote > sync > timer > internal)
//!
//! SMR handlers are synchronous and return [`SmrAction`]s. The loop
//! executes those after the lock is released, so network sends never
//! happen under the SMR lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hotchain_core::{
    AccessControlProvider, BlockCommitter, BlockVerifier, BlockchainStore, BusMessage,
    LedgerCache, MsgBus, NetService, SigningMember, StorageError, Subscriber, Topic,
    TransportError,
};
use hotchain_types::{Block, BlockInfo};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain_store::{ChainStore, ChainStoreError};
use crate::dispatch::{MsgDispatcher, RawMessage};
use crate::governance::{EpochView, GovernanceError, GovernanceProvider};
use crate::proposer::ProposerSelection;
use crate::qc::QcError;
use crate::smr::{ChainedBftSmr, SmrAction, SmrConfig, SmrDeps, SmrError};
use crate::timer::{TimeoutConfig, TimerEvent, TimerService};
use crate::types::{ConsensusMsg, ConsensusPayload, QuorumCert, RoundState, ValidatorIndex};
use crate::verifier::BlockSignatureVerifier;
use crate::wal::{ConsensusWal, WalConfig, WalError};

/// Engine construction and lifecycle errors.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// WAL could not be opened or written
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// Chain store bootstrap failed
    #[error("chain store error: {0}")]
    ChainStore(#[from] ChainStoreError),

    /// Governance lookup failed
    #[error("governance error: {0}")]
    Governance(#[from] GovernanceError),

    /// SMR construction failed
    #[error("state machine error: {0}")]
    Smr(#[from] SmrError),

    /// Embedded QC failed validation
    #[error("qc error: {0}")]
    Qc(#[from] QcError),

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Block carries no QC
    #[error("block {0} carries no quorum certificate")]
    MissingQc(u64),

    /// Embedded QC certifies a different block
    #[error("qc at height {qc_height} does not certify block {height}")]
    QcMismatch {
        /// Block height
        height: u64,
        /// QC height
        qc_height: u64,
    },

    /// Encoding failure
    #[error("codec error: {0}")]
    Codec(String),

    /// `start` was called twice
    #[error("engine already started")]
    AlreadyStarted,
}

/// Result type for engine operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default round timeouts
    pub timeouts: TimeoutConfig,
    /// Capacity of the protocol, sync, internal and timer channels. Raw
    /// peer intake gets a multiple of it.
    pub channel_capacity: usize,
    /// Proposer election scheme
    pub selection: ProposerSelection,
    /// Uncommitted heights kept below the commit height
    pub chain_store_retention: u64,
    /// Maximum blocks per fetch response
    pub fetch_batch_size: u32,
    /// Write-ahead log settings
    pub wal: WalConfig,
}

impl EngineConfig {
    /// Defaults with the WAL under `wal_dir`.
    pub fn with_wal_dir(wal_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            channel_capacity: 1024,
            selection: ProposerSelection::RoundRobin,
            chain_store_retention: 16,
            fetch_batch_size: 16,
            wal: WalConfig {
                dir: wal_dir.into(),
                ..WalConfig::default()
            },
        }
    }
}

/// Collaborators handed to the engine.
#[derive(Clone)]
pub struct ConsensusDeps {
    /// Local node id
    pub node_id: String,
    /// Local signer
    pub signer: Arc<dyn SigningMember>,
    /// Endorsement verification
    pub ac: Arc<dyn AccessControlProvider>,
    /// Peer transport
    pub net: Arc<dyn NetService>,
    /// Durable blocks
    pub store: Arc<dyn BlockchainStore>,
    /// Last committed block
    pub ledger: Arc<dyn LedgerCache>,
    /// Block checks before voting
    pub verifier: Arc<dyn BlockVerifier>,
    /// Makes committed blocks durable
    pub committer: Arc<dyn BlockCommitter>,
    /// Epoch source
    pub governance: Arc<dyn GovernanceProvider>,
    /// Internal pub/sub bus
    pub bus: Arc<MsgBus>,
}

/// Bus events routed to the SMR loop.
#[derive(Debug)]
enum InternalEvent {
    ProposedBlock(Block),
    BlockCommitted(Arc<BlockInfo>),
}

/// Raw intake holds this many lane capacities, so peer bursts wait on the
/// dispatcher's lane timeout instead of being dropped at the bus.
const RAW_INTAKE_FACTOR: usize = 4;

fn raw_intake_capacity(lane_capacity: usize) -> usize {
    lane_capacity.max(1).saturating_mul(RAW_INTAKE_FACTOR)
}

/// Bus subscriber feeding the engine. Never blocks the publisher.
struct EngineSubscriber {
    raw_tx: mpsc::Sender<RawMessage>,
    internal_tx: mpsc::Sender<InternalEvent>,
}

fn log_drop<T>(topic: Topic, result: Result<(), TrySendError<T>>) {
    match result {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(%topic, "Consensus intake full, dropping message");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(%topic, "Consensus intake closed");
        }
    }
}

impl Subscriber for EngineSubscriber {
    fn on_message(&self, msg: &BusMessage) {
        let topic = msg.topic();
        match msg {
            BusMessage::RecvConsensusMsg { from, payload } => log_drop(
                topic,
                self.raw_tx.try_send(RawMessage {
                    from: from.clone(),
                    payload: payload.clone(),
                }),
            ),
            BusMessage::ProposedBlock(block) => log_drop(
                topic,
                self.internal_tx
                    .try_send(InternalEvent::ProposedBlock(block.clone())),
            ),
            BusMessage::BlockInfo(info) => log_drop(
                topic,
                self.internal_tx
                    .try_send(InternalEvent::BlockCommitted(info.clone())),
            ),
            BusMessage::ProposeState(_) => {}
        }
    }
}

struct EngineReceivers {
    raw_rx: mpsc::Receiver<RawMessage>,
    protocol_rx: mpsc::Receiver<ConsensusPayload>,
    sync_rx: mpsc::Receiver<ConsensusPayload>,
    internal_rx: mpsc::Receiver<InternalEvent>,
    timer_rx: mpsc::Receiver<TimerEvent>,
    protocol_tx: mpsc::Sender<ConsensusPayload>,
    sync_tx: mpsc::Sender<ConsensusPayload>,
}

/// Chained-HotStuff consensus engine.
pub struct ChainedBftEngine {
    node_id: String,
    smr: Mutex<ChainedBftSmr>,
    round: Arc<crate::types::RoundStateCell>,
    epochs: Arc<RwLock<EpochView>>,
    signatures: BlockSignatureVerifier,
    net: Arc<dyn NetService>,
    bus: Arc<MsgBus>,
    wal: Arc<ConsensusWal>,
    timer: TimerService,
    round_timeout_ms: Arc<AtomicU64>,
    raw_tx: mpsc::Sender<RawMessage>,
    internal_tx: mpsc::Sender<InternalEvent>,
    receivers: Mutex<Option<EngineReceivers>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ChainedBftEngine {
    /// Open the WAL and chain store and build the SMR.
    ///
    /// Fails on WAL open errors, an empty store, or a governance lookup
    /// failure. These abort node startup.
    pub fn new(deps: ConsensusDeps, config: EngineConfig) -> ConsensusResult<Arc<Self>> {
        let wal = Arc::new(ConsensusWal::open(config.wal.clone())?);
        let chain_store = ChainStore::open(
            deps.ledger.clone(),
            deps.committer.clone(),
            deps.store.clone(),
            config.chain_store_retention,
        )?;

        let smr = ChainedBftSmr::new(
            SmrDeps {
                node_id: deps.node_id.clone(),
                signer: deps.signer.clone(),
                ac: deps.ac.clone(),
                verifier: deps.verifier.clone(),
                governance: deps.governance.clone(),
                wal: wal.clone(),
            },
            SmrConfig {
                selection: config.selection,
                timeouts: config.timeouts,
                fetch_batch_size: config.fetch_batch_size,
            },
            chain_store,
        )?;

        let capacity = config.channel_capacity.max(1);
        let (raw_tx, raw_rx) = mpsc::channel(raw_intake_capacity(capacity));
        let (protocol_tx, protocol_rx) = mpsc::channel(capacity);
        let (sync_tx, sync_rx) = mpsc::channel(capacity);
        let (internal_tx, internal_rx) = mpsc::channel(capacity);
        let (timer, timer_rx) = TimerService::new(capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let epochs = smr.epochs();
        let base_ms = epochs.read().current.timeouts.base.as_millis() as u64;

        Ok(Arc::new(Self {
            node_id: deps.node_id,
            round: smr.round_cell(),
            signatures: BlockSignatureVerifier::new(epochs.clone(), deps.ac),
            epochs,
            smr: Mutex::new(smr),
            net: deps.net,
            bus: deps.bus,
            wal,
            timer,
            round_timeout_ms: Arc::new(AtomicU64::new(base_ms)),
            raw_tx,
            internal_tx,
            receivers: Mutex::new(Some(EngineReceivers {
                raw_rx,
                protocol_rx,
                sync_rx,
                internal_rx,
                timer_rx,
                protocol_tx,
                sync_tx,
            })),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    /// Replay the WAL, subscribe to the bus and spawn the loops.
    pub async fn start(self: &Arc<Self>) -> ConsensusResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsensusError::AlreadyStarted);
        }
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or(ConsensusError::AlreadyStarted)?;

        let records = self.wal.replay_wal()?;
        let actions = {
            let mut smr = self.smr.lock();
            if !records.is_empty() {
                info!(records = records.len(), "Replaying consensus WAL");
                smr.replay(records);
            }
            smr.start()
        };

        let subscriber = Arc::new(EngineSubscriber {
            raw_tx: self.raw_tx.clone(),
            internal_tx: self.internal_tx.clone(),
        });
        for topic in [Topic::RecvConsensusMsg, Topic::ProposedBlock, Topic::BlockInfo] {
            self.bus.register(topic, subscriber.clone());
        }

        self.timer.start();
        let EngineReceivers {
            raw_rx,
            protocol_rx,
            sync_rx,
            internal_rx,
            timer_rx,
            protocol_tx,
            sync_tx,
        } = receivers;

        let dispatcher = MsgDispatcher::new(protocol_tx, sync_tx, self.round_timeout_ms.clone());
        let dispatch_task = tokio::spawn(dispatcher.run(raw_rx, self.shutdown_tx.subscribe()));
        let engine = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let smr_task = tokio::spawn(async move {
            engine
                .run(protocol_rx, sync_rx, timer_rx, internal_rx, shutdown)
                .await
        });
        self.tasks.lock().extend([dispatch_task, smr_task]);

        info!(node_id = %self.node_id, round = %self.round_state(), "Consensus engine started");
        self.execute(actions).await;
        Ok(())
    }

    /// Stop the loops and the timer and flush the WAL.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.timer.stop();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Consensus task failed");
            }
        }
        if let Err(e) = self.wal.flush() {
            warn!(error = %e, "Failed to flush consensus WAL");
        }
        info!(node_id = %self.node_id, "Consensus engine stopped");
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consistent (height, level, epoch, state).
    pub fn round_state(&self) -> RoundState {
        self.round.snapshot()
    }

    /// Height of the last committed block.
    pub fn commit_height(&self) -> u64 {
        self.smr.lock().chain_store().get_commit_height()
    }

    /// Validate the QC embedded in a committed block.
    pub fn verify_block_signatures(&self, block: &Block) -> ConsensusResult<QuorumCert> {
        self.signatures.verify_block_signatures(block)
    }

    /// Standalone verifier sharing this engine's epoch view.
    pub fn signature_verifier(&self) -> BlockSignatureVerifier {
        self.signatures.clone()
    }

    async fn run(
        self: Arc<Self>,
        mut protocol_rx: mpsc::Receiver<ConsensusPayload>,
        mut sync_rx: mpsc::Receiver<ConsensusPayload>,
        mut timer_rx: mpsc::Receiver<TimerEvent>,
        mut internal_rx: mpsc::Receiver<InternalEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let actions = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(payload) = protocol_rx.recv() => self.handle_payload(payload),
                Some(payload) = sync_rx.recv() => self.handle_payload(payload),
                Some(event) = timer_rx.recv() => self.handle_timer(event),
                Some(event) = internal_rx.recv() => self.handle_internal(event),
                else => break,
            };
            self.execute(actions).await;
        }
        debug!(node_id = %self.node_id, "SMR loop stopped");
    }

    fn handle_payload(&self, payload: ConsensusPayload) -> Vec<SmrAction> {
        let msg_type = payload.msg_type();
        let (height, level, author) = origin(&payload);
        let mut smr = self.smr.lock();
        let result = match payload {
            ConsensusPayload::Proposal(proposal) => smr.process_proposal(proposal),
            ConsensusPayload::Vote(vote) => smr.process_vote(vote),
            ConsensusPayload::BlockFetch(msg) => smr.process_block_fetch(msg),
            ConsensusPayload::BlockFetchResp(msg) => smr.process_fetch_resp(msg),
        };
        match result {
            Ok(actions) => actions,
            Err(e @ (SmrError::Stale { .. } | SmrError::AlreadyVoted { .. })) => {
                debug!(?msg_type, height, level, author, error = %e, "Dropped consensus message");
                Vec::new()
            }
            Err(e) => {
                warn!(?msg_type, height, level, author, error = %e, "Rejected consensus message");
                Vec::new()
            }
        }
    }

    fn handle_timer(&self, event: TimerEvent) -> Vec<SmrAction> {
        match self.smr.lock().process_local_timeout(event) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(height = event.height, level = event.level, error = %e, "Local timeout failed");
                Vec::new()
            }
        }
    }

    fn handle_internal(&self, event: InternalEvent) -> Vec<SmrAction> {
        let mut smr = self.smr.lock();
        match event {
            InternalEvent::ProposedBlock(block) => {
                let height = block.height();
                smr.process_proposed_block(block).unwrap_or_else(|e| {
                    warn!(height, error = %e, "Discarding proposed block");
                    Vec::new()
                })
            }
            InternalEvent::BlockCommitted(info) => {
                let height = info.block.height();
                smr.process_block_committed(&info.block).unwrap_or_else(|e| {
                    error!(height, error = %e, "Commit bookkeeping failed");
                    Vec::new()
                })
            }
        }
    }

    async fn execute(&self, actions: Vec<SmrAction>) {
        for action in actions {
            match action {
                SmrAction::Broadcast(payload) => {
                    let msg_type = payload.msg_type();
                    let Some(bytes) = encode(payload) else { continue };
                    if let Err(e) = self.net.broadcast_msg(bytes).await {
                        warn!(?msg_type, error = %e, "Broadcast failed");
                    }
                }
                SmrAction::SendTo { to, payload } => {
                    let msg_type = payload.msg_type();
                    let Some(node_id) = self.node_of(to) else {
                        warn!(to, ?msg_type, "No node for validator index");
                        continue;
                    };
                    let Some(bytes) = encode(payload) else { continue };
                    if let Err(e) = self.net.send_msg(bytes, &node_id).await {
                        warn!(to = %node_id, ?msg_type, error = %e, "Send failed");
                    }
                }
                SmrAction::ScheduleTimer(event) => {
                    self.round_timeout_ms
                        .store(event.duration.as_millis() as u64, Ordering::Relaxed);
                    self.timer.add_event(event);
                }
                SmrAction::RequestProposal(state) => {
                    if self.bus.publish(BusMessage::ProposeState(state)) == 0 {
                        warn!("No block builder subscribed to ProposeState");
                    }
                }
            }
        }
    }

    fn node_of(&self, index: ValidatorIndex) -> Option<String> {
        self.epochs
            .read()
            .current
            .validator(index)
            .map(|v| v.node_id.clone())
    }
}

fn encode(payload: ConsensusPayload) -> Option<bytes::Bytes> {
    match ConsensusMsg::new(payload).encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(error = %e, "Failed to encode consensus message");
            None
        }
    }
}

fn origin(payload: &ConsensusPayload) -> (u64, u64, ValidatorIndex) {
    match payload {
        ConsensusPayload::Proposal(p) => (p.height, p.level, p.proposer_idx),
        ConsensusPayload::Vote(v) => (v.height, v.level, v.author_idx),
        ConsensusPayload::BlockFetch(m) => (m.height, 0, m.author_idx),
        ConsensusPayload::BlockFetchResp(m) => (0, 0, m.author_idx),
    }
}
