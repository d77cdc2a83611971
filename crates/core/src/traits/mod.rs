//! Collaborator traits for hotchain.
//!
//! Consensus and snapshot code depends on these traits rather than on
//! concrete backends, so stores, networks and identity providers can be
//! swapped (and mocked in tests).
//!
//! ```ignore
//! use hotchain_core::traits::{BlockchainStore, NetService};
//!
//! fn catch_up<S: BlockchainStore, N: NetService>(store: &S, net: &N) {
//!     // works with any backend
//! }
//! ```

mod crypto;
mod pipeline;
mod storage;
mod transport;

pub use crypto::*;
pub use pipeline::*;
pub use storage::*;
pub use transport::*;
