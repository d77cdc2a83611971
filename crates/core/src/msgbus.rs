//! In-process publish/subscribe bus.
//!
//! Consensus registers for [`Topic::ProposedBlock`], [`Topic::RecvConsensusMsg`]
//! and [`Topic::BlockInfo`]; the core engine registers for
//! [`Topic::ProposeState`] and answers with a proposed block.
//!
//! ```text
//!  consensus ──ProposeState──▶ core engine
//!  consensus ◀─ProposedBlock── core engine
//!  consensus ◀─BlockInfo────── committer
//!  consensus ◀─RecvConsensusMsg─ network
//! ```
//!
//! Delivery is synchronous on the publisher's thread, so subscribers must
//! hand work off (e.g. `try_send` into a channel) instead of blocking.

use bytes::Bytes;
use hotchain_types::{Block, BlockInfo, Hash};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A block built by the core engine for the local proposer
    ProposedBlock,
    /// A raw consensus message received from a peer
    RecvConsensusMsg,
    /// A block was committed
    BlockInfo,
    /// Consensus asks the core engine to build a block
    ProposeState,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::ProposedBlock => write!(f, "ProposedBlock"),
            Topic::RecvConsensusMsg => write!(f, "RecvConsensusMsg"),
            Topic::BlockInfo => write!(f, "BlockInfo"),
            Topic::ProposeState => write!(f, "ProposeState"),
        }
    }
}

/// Request from consensus to build a block on top of `pre_block_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeState {
    /// Height of the block to build
    pub height: u64,
    /// Consensus level the block is for
    pub level: u64,
    /// Parent block hash
    pub pre_block_hash: Hash,
}

/// Payloads carried on the bus.
#[derive(Debug, Clone)]
pub enum BusMessage {
    /// See [`Topic::ProposedBlock`]
    ProposedBlock(Block),
    /// See [`Topic::RecvConsensusMsg`]
    RecvConsensusMsg {
        /// Sending node id
        from: String,
        /// Encoded consensus message
        payload: Bytes,
    },
    /// See [`Topic::BlockInfo`]
    BlockInfo(Arc<BlockInfo>),
    /// See [`Topic::ProposeState`]
    ProposeState(ProposeState),
}

impl BusMessage {
    /// The topic this payload belongs to.
    pub fn topic(&self) -> Topic {
        match self {
            BusMessage::ProposedBlock(_) => Topic::ProposedBlock,
            BusMessage::RecvConsensusMsg { .. } => Topic::RecvConsensusMsg,
            BusMessage::BlockInfo(_) => Topic::BlockInfo,
            BusMessage::ProposeState(_) => Topic::ProposeState,
        }
    }
}

/// A bus subscriber.
pub trait Subscriber: Send + Sync {
    /// Handle a published message. Must not block.
    fn on_message(&self, msg: &BusMessage);
}

/// Topic-keyed subscriber registry.
#[derive(Default)]
pub struct MsgBus {
    subscribers: RwLock<HashMap<Topic, Vec<Arc<dyn Subscriber>>>>,
}

impl MsgBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for `topic`.
    pub fn register(&self, topic: Topic, subscriber: Arc<dyn Subscriber>) {
        self.subscribers
            .write()
            .entry(topic)
            .or_default()
            .push(subscriber);
    }

    /// Deliver `msg` to every subscriber of its topic. Returns the number of
    /// subscribers reached.
    pub fn publish(&self, msg: BusMessage) -> usize {
        let topic = msg.topic();
        let subscribers = self
            .subscribers
            .read()
            .get(&topic)
            .cloned()
            .unwrap_or_default();
        trace!(%topic, subscribers = subscribers.len(), "publishing");
        for subscriber in &subscribers {
            subscriber.on_message(&msg);
        }
        subscribers.len()
    }

    /// Number of subscribers registered for `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers.read().get(&topic).map_or(0, Vec::len)
    }
}

impl fmt::Debug for MsgBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgBus")
            .field("topics", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Topic>>);

    impl Subscriber for Recorder {
        fn on_message(&self, msg: &BusMessage) {
            self.0.lock().push(msg.topic());
        }
    }

    #[test]
    fn test_publish_reaches_only_topic_subscribers() {
        let bus = MsgBus::new();
        let proposals = Arc::new(Recorder::default());
        let commits = Arc::new(Recorder::default());
        bus.register(Topic::ProposedBlock, proposals.clone());
        bus.register(Topic::BlockInfo, commits.clone());

        let reached = bus.publish(BusMessage::ProposedBlock(Block::genesis("c")));
        assert_eq!(reached, 1);
        assert_eq!(*proposals.0.lock(), vec![Topic::ProposedBlock]);
        assert!(commits.0.lock().is_empty());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = MsgBus::new();
        let msg = BusMessage::ProposeState(ProposeState {
            height: 1,
            level: 1,
            pre_block_hash: [0; 32],
        });
        assert_eq!(bus.publish(msg), 0);
        assert_eq!(bus.subscriber_count(Topic::ProposeState), 0);
    }
}
