//! Shared options and helpers for the CLI.

use anyhow::{Context, Result, bail};
use eth_worker::store::Store;
use eth_worker::{WalletStore, WorkerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Global options available on every command.
#[derive(clap::Args, Debug)]
pub struct GlobalOpts {
    /// Worker config file (JSON)
    #[arg(long, short, global = true, env = "ETH_WORKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

impl GlobalOpts {
    /// Loads the config file with environment overrides, or the defaults
    /// with environment overrides when no file is given.
    pub fn load_config(&self) -> Result<WorkerConfig> {
        match &self.config {
            Some(path) => WorkerConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display())),
            None => {
                let config = WorkerConfig::default().with_env_overrides();
                config.validate().context("invalid default config")?;
                Ok(config)
            }
        }
    }
}

/// Logs go to stderr so stdout stays free for responses.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The store snapshot named by `config`, with its path.
pub fn open_snapshot(config: &WorkerConfig) -> Result<(Arc<Store>, PathBuf)> {
    let Some(path) = config.snapshot_path.clone() else {
        bail!("snapshot_path is not set in the config");
    };
    let store = Store::load_snapshot(&path)
        .with_context(|| format!("failed to load snapshot {}", path.display()))?;
    Ok((Arc::new(store), path))
}

pub fn wallet_store(config: &WorkerConfig, store: Arc<Store>) -> Result<WalletStore> {
    let cipher = config.key_cipher().context("invalid encryption key")?;
    Ok(WalletStore::new(store, Arc::new(cipher)))
}

pub fn save_snapshot(store: &Store, path: &Path) -> Result<()> {
    store
        .save_snapshot(path)
        .with_context(|| format!("failed to save snapshot {}", path.display()))
}
