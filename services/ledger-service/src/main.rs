//! Ledger Service
//!
//! Records every SecureChat message in the hash-linked ledger and serves
//! participant views and integrity checks over HTTP.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::{Parser, Subcommand};
use securechat_ledger::{ChainStore, CodecConfig, LedgerConfig, ValidationReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod error;

/// Ledger Service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "ledger-service")]
#[command(about = "SecureChat Message Ledger Service")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8086")]
    port: u16,

    /// Storage path for ledger data
    #[arg(long, global = true)]
    storage_path: Option<String>,

    /// Master key for field encryption at rest
    #[arg(long, env = "LEDGER_MASTER_KEY", global = true, hide_env_values = true)]
    master_key: Option<String>,

    /// Append retries on write conflict
    #[arg(long)]
    max_retries: Option<u32>,

    /// JSON ledger configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the stored chain and exit
    Verify,
}

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<ChainStore>,
}

/// Build the ledger configuration from the optional file and CLI overrides
fn ledger_config(args: &Args) -> anyhow::Result<LedgerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<LedgerConfig>(&raw)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => LedgerConfig::default(),
    };

    if let Some(path) = &args.storage_path {
        config.storage_path = path.clone();
    }
    if let Some(key) = &args.master_key {
        config.codec = CodecConfig::encrypted(key.clone());
    }
    if let Some(retries) = args.max_retries {
        config.retry.max_retries = retries;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

/// Offline integrity check; fails when the chain is missing or broken
fn verify(config: &LedgerConfig) -> anyhow::Result<()> {
    let path = Path::new(&config.storage_path);
    if !path.is_dir() {
        anyhow::bail!("no ledger at {}", path.display());
    }

    let store = ChainStore::open(config)?;
    if store.is_empty()? {
        anyhow::bail!("ledger at {} has no blocks", path.display());
    }
    let validation = store.validate()?;

    let report = ValidationReport::from(&validation);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !validation.is_valid() {
        anyhow::bail!("ledger at {} failed validation: {}", config.storage_path, validation);
    }
    Ok(())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let config = ledger_config(&args)?;
    info!("Storage path: {}", config.storage_path);

    if let Some(Command::Verify) = args.command {
        return verify(&config);
    }

    info!("Starting Ledger Service");

    let store = ChainStore::open(&config).context("Failed to open ledger")?;
    if let Some(genesis) = store.initialize().context("Failed to initialize ledger")? {
        info!("Created genesis block {}", genesis.hash);
    }

    let app_state = web::Data::new(AppState {
        store: Arc::new(store),
    });

    info!("Binding to {}:{}", args.host, args.port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(api::configure_routes)
    })
    .bind((args.host.as_str(), args.port))?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "ledger-service",
            "--storage-path",
            "/tmp/ledger",
            "--max-retries",
            "7",
        ])
        .unwrap();

        let config = ledger_config(&args).unwrap();
        assert_eq!(config.storage_path, "/tmp/ledger");
        assert_eq!(config.retry.max_retries, 7);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_verify_subcommand() {
        let args =
            Args::try_parse_from(["ledger-service", "verify", "--storage-path", "/srv/ledger"])
                .unwrap();
        assert!(matches!(args.command, Some(Command::Verify)));
        assert_eq!(args.storage_path.as_deref(), Some("/srv/ledger"));
    }

    #[test]
    fn test_short_master_key_rejected() {
        let args = Args::try_parse_from(["ledger-service", "--master-key", "short"]).unwrap();
        assert!(ledger_config(&args).is_err());
    }

    #[test]
    fn test_verify_sound_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig::with_storage_path(dir.path().to_string_lossy());

        {
            let store = ChainStore::open(&config).unwrap();
            store.initialize().unwrap();
            store.append("alice", "bob", "ct1").unwrap();
        }
        assert!(verify(&config).is_ok());
    }

    #[test]
    fn test_verify_missing_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("typo");
        let config = LedgerConfig::with_storage_path(missing.to_string_lossy());

        assert!(verify(&config).is_err());
        assert!(!missing.exists());

        // Directory exists but holds no chain
        let config = LedgerConfig::with_storage_path(dir.path().to_string_lossy());
        assert!(verify(&config).is_err());
    }

    #[test]
    fn test_verify_fails_without_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LedgerConfig::with_storage_path(dir.path().to_string_lossy());
        config.codec = CodecConfig::encrypted("an-example-master-key-of-32-bytes!");

        {
            let store = ChainStore::open(&config).unwrap();
            store.initialize().unwrap();
            store.append("alice", "bob", "ct1").unwrap();
        }
        assert!(verify(&config).is_ok());

        // Ciphertext read as plain fields no longer hashes to the stored value
        config.codec = CodecConfig::default();
        assert!(verify(&config).is_err());
    }
}
