//! # Hotchain Types
//!
//! Data types shared by consensus, execution and storage:
//! - [`Block`] and [`BlockHeader`], with tx-inclusive hashing and the
//!   tx-free block fingerprint used to key execution snapshots
//! - [`Transaction`] and [`TxResult`]
//! - [`TxRWSet`] read/write sets and the per-block [`Dag`]
//! - [`Member`] identities and [`EndorsementEntry`] signatures
//! - [`codec`] for parallel batch marshalling of transactions
//!
//! ## Example
//!
//! ```rust
//! use hotchain_types::{Block, BlockHeader};
//!
//! let header = BlockHeader {
//!     chain_id: "chain1".into(),
//!     block_height: 1,
//!     ..Default::default()
//! };
//! let block = Block::new(header, vec![]);
//! assert_ne!(block.fingerprint(), block.compute_hash());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block;
pub mod codec;
pub mod identity;
pub mod rwset;
pub mod transaction;

pub use block::{
    AdditionalData, Block, BlockHeader, BlockInfo, Fingerprint, CURRENT_BLOCK_VERSION,
    QC_EXTRA_KEY,
};
pub use hotchain_crypto::{Hash, ZERO_HASH};
pub use identity::{EndorsementEntry, Member};
pub use rwset::{Dag, DagNeighbors, TxRWSet, TxRead, TxWrite};
pub use transaction::{ContractResult, Transaction, TxResult, TxStatusCode, TxType};

/// Result type alias for type-level operations
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised while encoding or decoding hotchain types
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// bincode encode or decode failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// A batch worker failed
    #[error("batch {batch} failed: {message}")]
    Batch {
        /// Index of the failing batch
        batch: usize,
        /// Underlying error
        message: String,
    },
}

impl From<bincode::Error> for TypesError {
    fn from(e: bincode::Error) -> Self {
        TypesError::Serialization(e.to_string())
    }
}
