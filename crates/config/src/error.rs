//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write configuration file
    #[error("Failed to write config file at {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to render TOML configuration
    #[error("Failed to serialize TOML config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Chain id is empty
    #[error("Invalid chain ID: chain_id must not be empty")]
    InvalidChainId,

    /// Invalid timeout configuration
    #[error("Invalid timeout: {name} must be positive, got {value}ms")]
    InvalidTimeout { name: &'static str, value: u64 },

    /// A capacity or size setting is zero
    #[error("Invalid {name}: must be at least 1")]
    ZeroSize { name: &'static str },

    /// Invalid public key format
    #[error("Invalid public key for validator {node_id}: {reason}")]
    InvalidPubkey { node_id: String, reason: String },

    /// Invalid private key, or one that does not match the public key
    #[error("Invalid private key for validator {node_id}: {reason}")]
    InvalidPrivateKey { node_id: String, reason: String },

    /// Two validators share an id
    #[error("Duplicate validator: {0}")]
    DuplicateValidator(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidLogFormat(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
