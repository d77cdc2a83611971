//! Tests for Config module

use hotchain_config::{
    ChainConfig, Config, ConfigError, ConsensusConfig, LoggingConfig, ProposerSelectionMode,
    SnapshotConfig, ValidatorEntry,
};
use hotchain_crypto::PrivateKey;
use std::time::Duration;

fn validator(node_id: &str) -> ValidatorEntry {
    ValidatorEntry {
        node_id: node_id.to_string(),
        org_id: "org1".to_string(),
        public_key: PrivateKey::random().public_key().to_hex(),
        private_key: None,
    }
}

#[test]
fn test_default_config_is_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.snapshot.gc_horizon, 8);
    assert_eq!(config.snapshot.legacy_read_version_threshold, 2201);
    assert_eq!(config.consensus.base_timeout(), Duration::from_millis(2000));
}

#[test]
fn test_empty_toml_uses_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config.chain.chain_id, "chain1");
    assert_eq!(config.consensus.proposer_selection, ProposerSelectionMode::RoundRobin);
}

#[test]
fn test_parse_full_toml() {
    let key = PrivateKey::random().public_key().to_hex();
    let toml = format!(
        r#"
[chain]
chain_id = "testchain"
node_id = "node1"
org_id = "org7"

[consensus]
base_timeout_ms = 1000
timeout_delta_ms = 250
max_timeout_ms = 8000
channel_capacity = 64
proposer_selection = "shuffled"
chain_store_retention = 4
fetch_batch_size = 8

[consensus.wal]
dir = "/tmp/hotchain-wal"
sync_on_write = false

[snapshot]
gc_horizon = 12
legacy_read_version_threshold = 100

[[validators]]
node_id = "node1"
public_key = "{key}"
"#
    );
    let config = Config::from_toml_str(&toml).unwrap();
    assert_eq!(config.chain.chain_id, "testchain");
    assert_eq!(config.consensus.proposer_selection, ProposerSelectionMode::Shuffled);
    assert!(!config.consensus.wal.sync_on_write);
    assert_eq!(config.snapshot.gc_horizon, 12);
    assert_eq!(config.validators[0].org_id, "org1");
}

#[test]
fn test_invalid_chain_id() {
    let config = ChainConfig {
        chain_id: "  ".into(),
        ..Default::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::InvalidChainId)));
}

#[test]
fn test_zero_base_timeout_rejected() {
    let config = ConsensusConfig {
        base_timeout_ms: 0,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidTimeout {
            name: "base_timeout_ms",
            value: 0
        })
    ));
}

#[test]
fn test_zero_channel_capacity_rejected() {
    let config = ConsensusConfig {
        channel_capacity: 0,
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ZeroSize {
            name: "channel_capacity"
        })
    ));
}

#[test]
fn test_zero_gc_horizon_rejected() {
    let config = SnapshotConfig {
        gc_horizon: 0,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_bad_log_format_rejected() {
    let config = LoggingConfig {
        level: "info".into(),
        format: "xml".into(),
    };
    assert!(matches!(config.validate(), Err(ConfigError::InvalidLogFormat(_))));
}

#[test]
fn test_duplicate_validator_rejected() {
    let config = Config {
        validators: vec![validator("a"), validator("a")],
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::DuplicateValidator(id)) if id == "a"
    ));
}

#[test]
fn test_malformed_public_key_rejected() {
    let mut entry = validator("a");
    entry.public_key = "zz".into();
    assert!(matches!(entry.validate(), Err(ConfigError::InvalidPubkey { .. })));
}

#[test]
fn test_save_and_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hotchain.toml");

    let mut config = Config::default();
    config.chain.node_id = "node3".into();
    config.validators.push(validator("node3"));
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded.chain.node_id, "node3");
    assert_eq!(loaded.validators.len(), 1);
}

#[test]
fn test_missing_file() {
    let result = Config::load(std::path::Path::new("/nonexistent/hotchain.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead { .. })));
}

#[test]
fn test_devnet_private_key_must_match() {
    let key = PrivateKey::random();
    let mut entry = validator("a");
    entry.public_key = key.public_key().to_hex();
    entry.private_key = Some(key.to_hex());
    assert!(entry.validate().is_ok());
    assert!(entry.parsed_private_key().unwrap().is_some());

    entry.private_key = Some(PrivateKey::random().to_hex());
    assert!(matches!(
        entry.validate(),
        Err(ConfigError::InvalidPrivateKey { .. })
    ));
}
