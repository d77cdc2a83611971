//! Main configuration module for hotchain

use crate::error::{ConfigError, ConfigResult};
use hotchain_crypto::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration struct containing all hotchain settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chain and node identity
    #[serde(default)]
    pub chain: ChainConfig,

    /// Consensus parameters
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Governance defaults for the static governance provider
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Execution snapshot parameters
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// In-process devnet shape
    #[serde(default)]
    pub devnet: DevnetConfig,

    /// Initial validator set, in index order
    #[serde(default)]
    pub validators: Vec<ValidatorEntry>,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!("Loading configuration from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content)?;

        debug!("Configuration parsed successfully, validating...");
        config.validate()?;

        info!(
            chain_id = %config.chain.chain_id,
            node_id = %config.chain.node_id,
            validators = config.validators.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.chain.validate()?;
        self.consensus.validate()?;
        self.snapshot.validate()?;
        self.logging.validate()?;
        self.devnet.validate()?;

        let mut seen = HashSet::new();
        for validator in &self.validators {
            validator.validate()?;
            if !seen.insert(validator.node_id.as_str()) {
                return Err(ConfigError::DuplicateValidator(validator.node_id.clone()));
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

// =============================================================================
// Chain Configuration
// =============================================================================

/// Chain and local node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier
    pub chain_id: String,

    /// Local node id
    pub node_id: String,

    /// Organisation the local member belongs to
    pub org_id: String,
}

impl ChainConfig {
    /// Reject an empty chain id.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chain_id.trim().is_empty() {
            return Err(ConfigError::InvalidChainId);
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: "chain1".to_string(),
            node_id: "node0".to_string(),
            org_id: "org1".to_string(),
        }
    }
}

// =============================================================================
// Consensus Configuration
// =============================================================================

/// How the proposer for (height, level) is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposerSelectionMode {
    /// `level % n`
    #[default]
    RoundRobin,
    /// Seeded shuffle keyed by (epoch, height, level)
    Shuffled,
}

/// Chained-HotStuff consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Base round timeout (milliseconds)
    pub base_timeout_ms: u64,

    /// Extra timeout per consecutive failed level (milliseconds)
    pub timeout_delta_ms: u64,

    /// Upper bound on any round timeout (milliseconds)
    pub max_timeout_ms: u64,

    /// Capacity of each inbound consensus channel
    pub channel_capacity: usize,

    /// Proposer election scheme
    #[serde(default)]
    pub proposer_selection: ProposerSelectionMode,

    /// Committed heights kept in the chain store cache
    pub chain_store_retention: u64,

    /// Maximum blocks returned per fetch response
    pub fetch_batch_size: u32,

    /// Write-ahead log settings
    #[serde(default)]
    pub wal: WalSection,
}

impl ConsensusConfig {
    /// Check timeouts and sizes.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                name: "base_timeout_ms",
                value: self.base_timeout_ms,
            });
        }
        if self.max_timeout_ms < self.base_timeout_ms {
            return Err(ConfigError::InvalidTimeout {
                name: "max_timeout_ms",
                value: self.max_timeout_ms,
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroSize {
                name: "channel_capacity",
            });
        }
        if self.fetch_batch_size == 0 {
            return Err(ConfigError::ZeroSize {
                name: "fetch_batch_size",
            });
        }
        Ok(())
    }

    /// Base round timeout.
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    /// Per-level backoff delta.
    pub fn timeout_delta(&self) -> Duration {
        Duration::from_millis(self.timeout_delta_ms)
    }

    /// Timeout cap.
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 2000,
            timeout_delta_ms: 500,
            max_timeout_ms: 30_000,
            channel_capacity: 1024,
            proposer_selection: ProposerSelectionMode::RoundRobin,
            chain_store_retention: 16,
            fetch_batch_size: 16,
            wal: WalSection::default(),
        }
    }
}

/// Write-ahead log location and durability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalSection {
    /// Directory holding `consensus.wal`
    pub dir: PathBuf,

    /// fsync after every entry
    pub sync_on_write: bool,
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/wal"),
            sync_on_write: true,
        }
    }
}

// =============================================================================
// Governance Configuration
// =============================================================================

/// Parameters for the static governance provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Blocks per epoch; 0 keeps a single epoch forever
    #[serde(default)]
    pub epoch_length: u64,

    /// Quorum floor; 0 derives it from the validator count
    #[serde(default)]
    pub min_quorum: u32,
}

// =============================================================================
// Snapshot Configuration
// =============================================================================

/// Execution snapshot parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshots trailing the committed height by more than this are evicted
    pub gc_horizon: u64,

    /// Blocks below this version record reads even from failed VM runs
    pub legacy_read_version_threshold: u32,
}

impl SnapshotConfig {
    /// Reject a zero horizon.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.gc_horizon == 0 {
            return Err(ConfigError::ZeroSize { name: "gc_horizon" });
        }
        Ok(())
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            gc_horizon: 8,
            legacy_read_version_threshold: 2201,
        }
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json, compact)
    pub format: String,
}

impl LoggingConfig {
    /// Check level and format names.
    pub fn validate(&self) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.level.clone()));
        }

        let valid_formats = ["text", "json", "compact"];
        if !valid_formats.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogFormat(self.format.clone()));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// =============================================================================
// Devnet Configuration
// =============================================================================

/// Shape of the in-process devnet started by `hotchain start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevnetConfig {
    /// Validators to run when `[[validators]]` is empty
    pub validator_count: usize,

    /// Synthetic transactions per proposed block
    pub txs_per_block: usize,

    /// Stop after this height; 0 runs until Ctrl-C
    #[serde(default)]
    pub stop_height: u64,
}

impl DevnetConfig {
    /// Require at least one validator.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.validator_count == 0 {
            return Err(ConfigError::ZeroSize {
                name: "validator_count",
            });
        }
        Ok(())
    }
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            validator_count: 4,
            txs_per_block: 4,
            stop_height: 0,
        }
    }
}

// =============================================================================
// Validators
// =============================================================================

/// One entry of the initial validator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorEntry {
    /// Node id used for message routing
    pub node_id: String,

    /// Organisation of the validator's member identity
    #[serde(default = "default_org")]
    pub org_id: String,

    /// Hex SEC1 public key
    pub public_key: String,

    /// Hex private key, for validators hosted by the in-process devnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

fn default_org() -> String {
    "org1".to_string()
}

impl ValidatorEntry {
    /// Check that the keys parse and belong together.
    pub fn validate(&self) -> ConfigResult<()> {
        let public_key = self.parsed_public_key()?;
        if let Some(private_key) = self.parsed_private_key()? {
            if private_key.public_key() != public_key {
                return Err(ConfigError::InvalidPrivateKey {
                    node_id: self.node_id.clone(),
                    reason: "does not match public_key".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Parsed public key.
    pub fn parsed_public_key(&self) -> ConfigResult<PublicKey> {
        PublicKey::from_hex(&self.public_key).map_err(|e| ConfigError::InvalidPubkey {
            node_id: self.node_id.clone(),
            reason: e.to_string(),
        })
    }

    /// Parsed private key, if one is configured.
    pub fn parsed_private_key(&self) -> ConfigResult<Option<PrivateKey>> {
        self.private_key
            .as_deref()
            .map(|hex| {
                PrivateKey::from_hex(hex).map_err(|e| ConfigError::InvalidPrivateKey {
                    node_id: self.node_id.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}
