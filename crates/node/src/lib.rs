//! # Hotchain Node
//!
//! Glue between the chained-HotStuff engine and the execution snapshots:
//!
//! - [`executor`] - the devnet bank VM, parallel and sequential block execution
//! - [`block_builder`] - answers `ProposeState` with an executed block
//! - [`verifier`] - re-executes proposals before the engine votes
//! - [`committer`] - persists certified blocks and retires their snapshots
//! - [`network`] - loopback transport for in-process validators
//! - [`devnet`] - wires a whole validator set inside one process
//!
//! ```text
//!  ProposeState ──► BlockBuilder ──► ProposedBlock ──► engine
//!                        │                               │
//!                        ▼                               ▼
//!                  BlockExecutor ◄── ExecutingVerifier ◄─┤
//!                        │                               │
//!                 SnapshotManager ◄── LedgerCommitter ◄──┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block_builder;
pub mod committer;
pub mod devnet;
pub mod executor;
pub mod network;
pub mod verifier;

pub use block_builder::BlockBuilder;
pub use committer::LedgerCommitter;
pub use devnet::{Devnet, DevnetNode};
pub use executor::{BlockExecutor, ExecutionError, ExecutionOutput, ExecutionResult};
pub use network::{LoopbackHub, LoopbackNet};
pub use verifier::ExecutingVerifier;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration file read by `hotchain start` when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "hotchain.toml";
