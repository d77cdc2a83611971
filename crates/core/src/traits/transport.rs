//! Network service used by consensus to reach other validators.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while sending messages.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The destination node is not connected.
    #[error("peer not connected: {0}")]
    NotConnected(String),

    /// The outbound queue is closed.
    #[error("transport closed")]
    Closed,

    /// Generic network failure.
    #[error("network error: {0}")]
    Network(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Message delivery between validators, identified by node id.
#[async_trait]
pub trait NetService: Send + Sync + 'static {
    /// Deliver `payload` to every other validator.
    async fn broadcast_msg(&self, payload: Bytes) -> TransportResult<()>;

    /// Deliver `payload` to the node `to`.
    async fn send_msg(&self, payload: Bytes, to: &str) -> TransportResult<()>;

    /// This node's id.
    fn local_node_id(&self) -> String;
}
