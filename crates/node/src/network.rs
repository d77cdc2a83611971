//! In-process transport connecting devnet validators.
//!
//! Every node registers its message bus with a shared [`LoopbackHub`];
//! sending to a peer publishes a `RecvConsensusMsg` on that peer's bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hotchain_core::{BusMessage, MsgBus, NetService, TransportError, TransportResult};
use parking_lot::RwLock;
use tracing::trace;

/// Registry of node buses reachable over loopback.
#[derive(Default)]
pub struct LoopbackHub {
    peers: RwLock<HashMap<String, Arc<MsgBus>>>,
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `bus` under `node_id` and return that node's transport.
    pub fn join(self: &Arc<Self>, node_id: impl Into<String>, bus: Arc<MsgBus>) -> LoopbackNet {
        let node_id = node_id.into();
        self.peers.write().insert(node_id.clone(), bus);
        LoopbackNet {
            node_id,
            hub: self.clone(),
        }
    }

    /// Detach `node_id`; later sends to it fail with `NotConnected`.
    pub fn leave(&self, node_id: &str) {
        self.peers.write().remove(node_id);
    }

    fn deliver(&self, from: &str, to: &str, payload: Bytes) -> TransportResult<()> {
        let bus = self
            .peers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(to.to_string()))?;
        trace!(from, to, bytes = payload.len(), "Loopback delivery");
        bus.publish(BusMessage::RecvConsensusMsg {
            from: from.to_string(),
            payload,
        });
        Ok(())
    }
}

/// One node's view of the [`LoopbackHub`].
pub struct LoopbackNet {
    node_id: String,
    hub: Arc<LoopbackHub>,
}

#[async_trait]
impl NetService for LoopbackNet {
    async fn broadcast_msg(&self, payload: Bytes) -> TransportResult<()> {
        let targets: Vec<String> = self
            .hub
            .peers
            .read()
            .keys()
            .filter(|id| **id != self.node_id)
            .cloned()
            .collect();
        for to in targets {
            // a peer leaving mid-broadcast is not an error for the others
            let _ = self.hub.deliver(&self.node_id, &to, payload.clone());
        }
        Ok(())
    }

    async fn send_msg(&self, payload: Bytes, to: &str) -> TransportResult<()> {
        self.hub.deliver(&self.node_id, to, payload)
    }

    fn local_node_id(&self) -> String {
        self.node_id.clone()
    }
}
