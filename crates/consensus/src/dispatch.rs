//! Routing of inbound consensus messages.
//!
//! Raw messages from the bus are decoded here and split into protocol
//! traffic (proposals and votes) and sync traffic (block fetch). Each lane
//! has its own bounded channel so a burst of fetch responses cannot delay
//! votes. A full lane drops the message after one round timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::types::{ConsensusMsg, ConsensusPayload};

/// Encoded message as received from a peer.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Sending node id
    pub from: String,
    /// Encoded [`ConsensusMsg`]
    pub payload: Bytes,
}

/// Decodes raw messages and routes them to the protocol or sync lane.
pub struct MsgDispatcher {
    protocol_tx: mpsc::Sender<ConsensusPayload>,
    sync_tx: mpsc::Sender<ConsensusPayload>,
    round_timeout_ms: Arc<AtomicU64>,
}

impl MsgDispatcher {
    /// Route into `protocol_tx` and `sync_tx`, waiting at most
    /// `round_timeout_ms` for capacity.
    pub fn new(
        protocol_tx: mpsc::Sender<ConsensusPayload>,
        sync_tx: mpsc::Sender<ConsensusPayload>,
        round_timeout_ms: Arc<AtomicU64>,
    ) -> Self {
        Self {
            protocol_tx,
            sync_tx,
            round_timeout_ms,
        }
    }

    /// Decode and route one message. Returns whether it was delivered.
    pub async fn dispatch(&self, raw: RawMessage) -> bool {
        let msg = match ConsensusMsg::decode(&raw.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(from = %raw.from, error = %e, "Dropping undecodable consensus message");
                return false;
            }
        };
        let msg_type = msg.payload.msg_type();
        let lane = if msg_type.is_protocol() {
            &self.protocol_tx
        } else {
            &self.sync_tx
        };
        trace!(from = %raw.from, ?msg_type, "Dispatching consensus message");

        let timeout = Duration::from_millis(self.round_timeout_ms.load(Ordering::Relaxed));
        match lane.send_timeout(msg.payload, timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(from = %raw.from, ?msg_type, timeout_ms = timeout.as_millis() as u64, "Consensus lane full, dropping message");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(?msg_type, "Consensus lane closed");
                false
            }
        }
    }

    /// Drain `raw_rx` until it closes or `shutdown` fires.
    pub async fn run(self, mut raw_rx: mpsc::Receiver<RawMessage>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                raw = raw_rx.recv() => match raw {
                    Some(raw) => {
                        self.dispatch(raw).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Message dispatcher stopped");
    }
}
