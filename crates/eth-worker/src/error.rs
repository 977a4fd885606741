//! Error types for the eth worker.
//!
//! This module provides a unified error type [`WorkerError`] covering every
//! failure the worker can observe, from node rejections to lock contention.
//! Helpers on the type classify errors the way the supervisor consumes them:
//! transient conditions are rescheduled, structural ones are surfaced.

use thiserror::Error;
use uuid::Uuid;

/// A specialized Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// The main error type for the eth worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The transaction was rejected before it reached the chain (bad nonce,
    /// insufficient funds, malformed call). Goes straight to the task retry
    /// policy, never to confirmation polling.
    #[error("Pre-blockchain error: {0}")]
    PreBlockchain(String),

    /// The invocation round for a task has used its whole retry budget.
    #[error("Task {task_uuid} exceeded its retry budget after {attempts} attempts")]
    TaskRetriesExceeded {
        /// The task that ran out of retries
        task_uuid: Uuid,
        /// Attempts made in the exhausted round
        attempts: u32,
    },

    /// A wallet for this address already exists.
    #[error("Wallet already exists: {0}")]
    WalletExists(String),

    /// A named lock is held elsewhere. The caller skips this cycle.
    #[error("Lock not acquired: {0}")]
    LockNotAcquired(String),

    /// Error talking to the chain node (timeout, connection reset, bad
    /// response).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Error occurred during HTTP communication
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Error occurred during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error occurred during hex encoding/decoding
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Error reading or writing local files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid chain address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid private key
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Key encryption or decryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// ABI lookup or encoding failed
    #[error("ABI error: {0}")]
    Abi(String),

    /// No task with this identifier
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No transaction with this identifier
    #[error("Transaction not found: {0}")]
    TransactionNotFound(u64),

    /// No wallet with this address
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// The application webhook answered with a non-success status
    #[error("Webhook error ({status_code}): {message}")]
    Webhook {
        /// HTTP status code
        status_code: u16,
        /// Response body or reason
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal worker error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Maximum length for error messages to prevent excessive memory usage in logs.
const MAX_ERROR_MESSAGE_LENGTH: usize = 1000;

/// Patterns that might indicate sensitive information in error messages.
const SENSITIVE_PATTERNS: &[&str] = &[
    "private_key",
    "private key",
    "secret",
    "password",
    "authorization",
];

impl WorkerError {
    /// Creates a new pre-blockchain error
    pub fn pre_blockchain<S: Into<String>>(msg: S) -> Self {
        Self::PreBlockchain(msg.into())
    }

    /// Creates a new RPC error
    pub fn rpc<E: std::fmt::Display>(err: E) -> Self {
        Self::Rpc(err.to_string())
    }

    /// Creates a new ABI error
    pub fn abi<S: Into<String>>(msg: S) -> Self {
        Self::Abi(msg.into())
    }

    /// Returns true if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound(_) | Self::TransactionNotFound(_) | Self::WalletNotFound(_)
        )
    }

    /// Returns true for conditions that are expected to clear on their own
    /// and must be absorbed by rescheduling rather than failing a task.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockNotAcquired(_) | Self::Rpc(_)) || self.is_retryable()
    }

    /// Returns true if this is a transport error that might succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Rpc(_) => true,
            Self::Webhook { status_code, .. } => {
                matches!(status_code, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    /// Short name of the error kind, recorded on transaction rows and sent in
    /// webhook payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreBlockchain(_) => "PreBlockchainError",
            Self::TaskRetriesExceeded { .. } => "TaskRetriesExceededError",
            Self::WalletExists(_) => "WalletExistsError",
            Self::LockNotAcquired(_) => "LockNotAcquired",
            Self::Rpc(_) => "RpcError",
            Self::Http(_) => "HttpError",
            Self::Json(_) => "JsonError",
            Self::Hex(_) => "HexError",
            Self::Io(_) => "IoError",
            Self::InvalidAddress(_) => "InvalidAddress",
            Self::InvalidPrivateKey(_) => "InvalidPrivateKey",
            Self::Encryption(_) => "EncryptionError",
            Self::Abi(_) => "AbiError",
            Self::TaskNotFound(_) => "TaskNotFound",
            Self::TransactionNotFound(_) => "TransactionNotFound",
            Self::WalletNotFound(_) => "WalletNotFound",
            Self::Webhook { .. } => "WebhookError",
            Self::Config(_) => "ConfigError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Returns a sanitized version of the error message safe for logging and
    /// for the `message` field of webhook payloads.
    ///
    /// This method:
    /// - Removes control characters that could corrupt logs
    /// - Truncates very long messages to prevent log flooding
    /// - Redacts patterns that might indicate sensitive information
    pub fn sanitized_message(&self) -> String {
        sanitize_string(&self.to_string())
    }
}

/// Sanitizes a string for safe logging.
pub(crate) fn sanitize_string(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    let lower = cleaned.to_lowercase();
    for pattern in SENSITIVE_PATTERNS {
        if lower.contains(pattern) {
            return format!("[REDACTED: message contained sensitive pattern '{pattern}']");
        }
    }

    if cleaned.len() > MAX_ERROR_MESSAGE_LENGTH {
        let mut end = MAX_ERROR_MESSAGE_LENGTH;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}... [truncated, total length: {}]",
            &cleaned[..end],
            cleaned.len()
        )
    } else {
        cleaned
    }
}
