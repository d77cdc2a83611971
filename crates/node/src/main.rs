//! # Hotchain
//!
//! Command line entry point: runs an in-process devnet and manages keys
//! and configuration files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hotchain_config::{Config, ValidatorEntry};
use hotchain_crypto::PrivateKey;
use hotchain_node::{Devnet, DEFAULT_CONFIG_FILE, VERSION};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Hotchain devnet and tools
#[derive(Parser, Debug)]
#[command(name = "hotchain")]
#[command(version)]
#[command(about = "Chained-HotStuff devnet with parallel snapshot execution")]
struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format: text, json, or compact (overrides the config file)
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the validators described by a configuration file
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, env = "HOTCHAIN_CONFIG")]
        config: PathBuf,
    },

    /// Generate a validator key pair
    Keygen,

    /// Write a configuration with freshly generated validators
    Init {
        /// Output file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,

        /// Chain ID
        #[arg(long, default_value = "chain1")]
        chain_id: String,

        /// Number of validators
        #[arg(long, default_value = "4")]
        validators: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => {
            let config = Config::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_tracing(cli.verbose, cli.log_format, Some(&config))?;
            info!(version = VERSION, chain_id = %config.chain.chain_id, "Starting hotchain");

            let devnet = Devnet::new(&config)?;
            devnet.run().await
        }
        Commands::Keygen => {
            let key = PrivateKey::random();
            println!("private_key = \"{}\"", key.to_hex());
            println!("public_key = \"{}\"", key.public_key().to_hex());
            Ok(())
        }
        Commands::Init {
            output,
            chain_id,
            validators,
        } => {
            init_tracing(cli.verbose, cli.log_format, None)?;
            handle_init(output, chain_id, validators)
        }
    }
}

fn handle_init(output: PathBuf, chain_id: String, validators: usize) -> Result<()> {
    let mut config = Config::default();
    config.chain.chain_id = chain_id;
    config.devnet.validator_count = validators;
    config.validators = (0..validators)
        .map(|i| {
            let key = PrivateKey::random();
            ValidatorEntry {
                node_id: format!("node{i}"),
                org_id: format!("org{i}"),
                public_key: key.public_key().to_hex(),
                private_key: Some(key.to_hex()),
            }
        })
        .collect();
    config.validate()?;
    config
        .save(&output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(path = %output.display(), validators, "Wrote configuration");
    Ok(())
}

/// Initialize tracing from CLI flags, falling back to the config file.
fn init_tracing(verbose: u8, format: Option<LogFormat>, config: Option<&Config>) -> Result<()> {
    let filter = match verbose {
        0 => config
            .map(|c| c.logging.level.to_lowercase())
            .unwrap_or_else(|| "info".to_string()),
        1 => "info,hotchain=debug".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let format = format.unwrap_or_else(|| {
        match config.map(|c| c.logging.format.to_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            Some("compact") => LogFormat::Compact,
            _ => LogFormat::Text,
        }
    });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .try_init()?,
        LogFormat::Compact => tracing_subscriber::registry()
            .with(fmt::layer().compact())
            .with(env_filter)
            .try_init()?,
    }

    Ok(())
}
