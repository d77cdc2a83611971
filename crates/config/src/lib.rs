//! # Hotchain Configuration
//!
//! All node settings live in one `hotchain.toml` file.
//!
//! ```rust,ignore
//! use hotchain_config::Config;
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("hotchain.toml"))?;
//! println!("chain: {}", config.chain.chain_id);
//! ```
//!
//! ## Configuration Sections
//!
//! - `[chain]` - chain and node identity
//! - `[consensus]` - pacemaker timeouts, channel sizes, proposer selection
//! - `[consensus.wal]` - write-ahead log location
//! - `[governance]` - epoch length and quorum floor
//! - `[snapshot]` - snapshot GC horizon and read-table compatibility threshold
//! - `[logging]` - log level and format
//! - `[devnet]` - in-process devnet shape
//! - `[[validators]]` - initial validator set

mod config;
mod error;

pub use config::*;
pub use error::*;
