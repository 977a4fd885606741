//! Worker configuration.
//!
//! [`WorkerConfig`] is read from a JSON file in which every field is
//! optional, then secrets are overlaid from the environment:
//!
//! | Variable                    | Field                |
//! |-----------------------------|----------------------|
//! | `ETH_WORKER_RPC_URL`        | `rpc_url`            |
//! | `ETH_WORKER_ENCRYPTION_KEY` | `encryption_key`     |
//! | `ETH_WORKER_MASTER_KEY`     | `master_private_key` |
//! | `ETH_WORKER_WEBHOOK_SECRET` | `webhook.secret`     |
//!
//! # Example
//!
//! ```rust
//! use eth_worker::WorkerConfig;
//!
//! let config = WorkerConfig::default()
//!     .with_rpc_url("http://127.0.0.1:8545")
//!     .with_encryption_key(eth_worker::KeyCipher::generate_key())
//!     .with_max_retries(5);
//! assert!(config.validate().is_ok());
//! ```

use crate::crypto::KeyCipher;
use crate::error::{WorkerError, WorkerResult};
use crate::nonce::NonceSettings;
use crate::retry::{PollBackoff, RetryConfig, TaskRetryPolicy};
use crate::submitter::GasSettings;
use crate::supervisor::SupervisorSettings;
use crate::sync::SyncSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const WEI_PER_GWEI: u128 = 1_000_000_000;

/// Application webhook settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: Url,
    #[serde(default = "default_webhook_username")]
    pub username: String,
    /// Basic-auth password. Usually supplied through the environment.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    /// In-place retries of a single delivery.
    #[serde(default = "default_webhook_retries")]
    pub max_retries: u32,
}

fn default_webhook_username() -> String {
    "eth_worker".to_string()
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

fn default_webhook_retries() -> u32 {
    3
}

impl WebhookConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::builder().max_retries(self.max_retries).build()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Lock timings, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub task_ttl_ms: u64,
    pub task_wait_ms: u64,
    pub nonce_ttl_ms: u64,
    pub nonce_wait_ms: u64,
    pub dedup_ttl_ms: u64,
    /// How long a reversal claim blocks other dedup sweeps for a task.
    pub reversal_claim_ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            task_ttl_ms: 10_000,
            task_wait_ms: 1_000,
            nonce_ttl_ms: 10_000,
            nonce_wait_ms: 5_000,
            dedup_ttl_ms: 60_000,
            reversal_claim_ttl_ms: 600_000,
        }
    }
}

/// Settings of a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub rpc_url: String,
    /// Queried from the node when unset.
    pub chain_id: Option<u64>,
    /// base64 AES-256 key protecting private keys at rest.
    pub encryption_key: Option<String>,
    /// Hex key of the wallet that funds top-ups.
    pub master_private_key: Option<String>,
    pub webhook: Option<WebhookConfig>,
    pub task_retry: TaskRetryPolicy,
    pub poll: PollBackoff,
    pub pending_expiry_secs: u64,
    pub max_gas_limit: u64,
    pub gas_margin_percent: u64,
    /// Fixed gas price. The node's price is used when unset.
    pub gas_price_gwei: Option<u64>,
    pub locks: LockConfig,
    pub sync: SyncSettings,
    /// Seconds between wallet top-up sweeps. Zero disables them.
    pub topup_interval_secs: u64,
    /// Directory of extra contract ABIs and bytecode.
    pub contracts_dir: Option<PathBuf>,
    /// Store snapshot file. The store is in-memory only when unset.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub max_submit_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: None,
            encryption_key: None,
            master_private_key: None,
            webhook: None,
            task_retry: TaskRetryPolicy::default(),
            poll: PollBackoff::default(),
            pending_expiry_secs: 300,
            max_gas_limit: 8_000_000,
            gas_margin_percent: 20,
            gas_price_gwei: None,
            locks: LockConfig::default(),
            sync: SyncSettings::default(),
            topup_interval_secs: 60,
            contracts_dir: None,
            snapshot_path: None,
            snapshot_interval_secs: 30,
            max_submit_retries: 5,
        }
    }
}

impl WorkerConfig {
    /// Reads a config file, applies environment overrides and validates the
    /// result.
    pub fn load(path: &Path) -> WorkerResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            WorkerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlays `ETH_WORKER_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("ETH_WORKER_RPC_URL") {
            self.rpc_url = url;
        }
        if let Some(key) = lookup("ETH_WORKER_ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }
        if let Some(key) = lookup("ETH_WORKER_MASTER_KEY") {
            self.master_private_key = Some(key);
        }
        if let (Some(secret), Some(webhook)) =
            (lookup("ETH_WORKER_WEBHOOK_SECRET"), self.webhook.as_mut())
        {
            webhook.secret = secret;
        }
        self
    }

    /// Checks the settings the worker cannot start without.
    pub fn validate(&self) -> WorkerResult<()> {
        self.rpc_url()?;
        self.key_cipher()?;
        if self.task_retry.max_retries == 0 {
            return Err(WorkerError::Config(
                "task_retry.max_retries must be at least 1".to_string(),
            ));
        }
        if self.sync.chunk_size == 0 {
            return Err(WorkerError::Config(
                "sync.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.max_gas_limit < 21_000 {
            return Err(WorkerError::Config(format!(
                "max_gas_limit {} is below the cost of a transfer",
                self.max_gas_limit
            )));
        }
        if let Some(webhook) = &self.webhook {
            if webhook.secret.is_empty() {
                return Err(WorkerError::Config(
                    "webhook.secret is empty; set ETH_WORKER_WEBHOOK_SECRET".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> WorkerResult<Url> {
        Url::parse(&self.rpc_url)
            .map_err(|e| WorkerError::Config(format!("invalid rpc_url {}: {e}", self.rpc_url)))
    }

    pub fn key_cipher(&self) -> WorkerResult<KeyCipher> {
        let key = self.encryption_key.as_deref().ok_or_else(|| {
            WorkerError::Config(
                "encryption_key is required; set ETH_WORKER_ENCRYPTION_KEY".to_string(),
            )
        })?;
        KeyCipher::from_base64(key)
    }

    pub fn gas_settings(&self) -> GasSettings {
        GasSettings {
            max_gas_limit: self.max_gas_limit,
            estimate_margin_percent: self.gas_margin_percent,
            gas_price_override: self
                .gas_price_gwei
                .map(|gwei| u128::from(gwei) * WEI_PER_GWEI),
        }
    }

    pub fn nonce_settings(&self) -> NonceSettings {
        NonceSettings {
            pending_expiry: Duration::from_secs(self.pending_expiry_secs),
            lock_ttl: Duration::from_millis(self.locks.nonce_ttl_ms),
            lock_wait: Duration::from_millis(self.locks.nonce_wait_ms),
        }
    }

    pub fn supervisor_settings(&self, chain_id: u64) -> SupervisorSettings {
        SupervisorSettings {
            retry: self.task_retry,
            poll: self.poll,
            gas: self.gas_settings(),
            nonce: self.nonce_settings(),
            chain_id,
            task_lock_ttl: Duration::from_millis(self.locks.task_ttl_ms),
            task_lock_wait: Duration::from_millis(self.locks.task_wait_ms),
            dedup_lock_ttl: Duration::from_millis(self.locks.dedup_ttl_ms),
            reversal_claim_ttl: Duration::from_millis(self.locks.reversal_claim_ttl_ms),
            max_submit_retries: self.max_submit_retries,
        }
    }

    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = url.into();
        self
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_master_private_key(mut self, key: impl Into<String>) -> Self {
        self.master_private_key = Some(key.into());
        self
    }

    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// Sets the number of attempts a task gets per invocation round.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.task_retry.max_retries = max_retries;
        self
    }

    pub fn with_task_retry(mut self, policy: TaskRetryPolicy) -> Self {
        self.task_retry = policy;
        self
    }

    pub fn with_poll(mut self, poll: PollBackoff) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_gas_price_gwei(mut self, gwei: u64) -> Self {
        self.gas_price_gwei = Some(gwei);
        self
    }

    pub fn with_sync(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_contracts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.contracts_dir = Some(dir.into());
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }
}
