//! # Hotchain Core - Collaborator Abstractions
//!
//! This crate defines the interfaces the consensus engine and the execution
//! snapshot consume from the rest of the node:
//!
//! - **Storage**: [`BlockchainStore`] and [`LedgerCache`]
//! - **Identity**: [`SigningMember`] and [`AccessControlProvider`]
//! - **Network**: [`NetService`]
//! - **Block pipeline**: [`BlockVerifier`] and [`BlockCommitter`]
//! - **Message bus**: [`MsgBus`] topics connecting consensus and core engine
//!
//! It also ships in-memory implementations ([`memory`]) and a secp256k1
//! identity provider ([`identity`]) used by tests and the devnet.
//!
//! | Component | Trait | Bundled Impl |
//! |-----------|-------|--------------|
//! | Block store | `BlockchainStore` | `MemoryBlockchainStore` |
//! | Ledger | `LedgerCache` | `MemoryLedgerCache` |
//! | Signing | `SigningMember` | `KeySigningMember` |
//! | Access control | `AccessControlProvider` | `KeyAccessControl` |

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod identity;
pub mod memory;
pub mod msgbus;
pub mod traits;

pub use identity::{KeyAccessControl, KeySigningMember};
pub use memory::{MemoryBlockchainStore, MemoryLedgerCache};
pub use msgbus::{BusMessage, MsgBus, ProposeState, Subscriber, Topic};
pub use traits::{
    // Crypto
    AccessControlProvider, CryptoError, CryptoResult, Principal, SigningMember,
    RESOURCE_CONSENSUS,
    // Pipeline
    BlockCommitter, BlockError, BlockResult, BlockVerifier, VerifyMode,
    // Storage
    BlockchainStore, LedgerCache, StorageError, StorageResult,
    // Transport
    NetService, TransportError, TransportResult,
};
