//! Blockchain transaction execution and supervision for EVM chains.
//!
//! Applications hand the worker *tasks*: send value, call a contract
//! function, deploy a contract. The worker signs with a custodied wallet,
//! allocates nonces, broadcasts, polls for receipts, retries failed attempts
//! with backoff, honours ordering between tasks, keeps wallets topped up
//! from a master wallet and reports every state change to the application
//! through a webhook. A separate scanner mirrors third-party token transfers
//! of watched contracts.
//!
//! The entry point is [`EthWorkerBuilder`]:
//!
//! ```no_run
//! use eth_worker::{EthWorkerBuilder, KeyCipher, WorkerConfig};
//!
//! # async fn run() -> eth_worker::WorkerResult<()> {
//! let config = WorkerConfig::default().with_encryption_key(KeyCipher::generate_key());
//! let worker = EthWorkerBuilder::new(config).build().await?;
//! let handle = worker.start()?;
//! # worker.stop()?;
//! # handle.await.ok();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod lock;
pub mod nonce;
pub mod poller;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod submitter;
pub mod supervisor;
pub mod sync;
pub mod types;
pub mod wallet;
pub mod webhook;
pub mod worker;

pub use api::{TaskRequest, TaskResponse, TaskView};
pub use chain::{ChainClient, RpcChainClient};
pub use config::{WebhookConfig, WorkerConfig};
pub use crypto::KeyCipher;
pub use error::{WorkerError, WorkerResult};
pub use store::Store;
pub use supervisor::{AttemptOutcome, CreateTask, TaskSupervisor};
pub use sync::ThirdPartySyncScanner;
pub use types::*;
pub use wallet::{WalletRef, WalletStore};
pub use worker::{EthWorker, EthWorkerBuilder};
