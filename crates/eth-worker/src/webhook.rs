//! Outbound transaction callbacks.
//!
//! Every mutation of a transaction row is followed by an explicit call to a
//! [`Publisher`]. The production publisher POSTs a [`TransactionCallback`] to
//! the application with basic auth, retrying transient failures in place.
//!
//! [`CallbackLedger`] is the receiving side of the contract: it keeps the
//! latest state per task and ignores callbacks that arrive out of order.

use crate::error::{WorkerError, WorkerResult};
use crate::retry::RetryExecutor;
use crate::store::Store;
use crate::types::{Transaction, TransactionStatus};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Path the application serves callbacks on when the configured URL has none.
pub const DEFAULT_CALLBACK_PATH: &str = "/internal/transaction-callback";

/// Body of a transaction callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCallback {
    /// Serialized as `null` for third-party transfers, which belong to no
    /// task; receivers key those by `hash`.
    pub task_uuid: Option<Uuid>,
    /// Unix seconds of the row mutation this callback reports.
    pub timestamp: f64,
    pub status: TransactionStatus,
    pub error: Option<String>,
    pub message: Option<String>,
    pub hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_address: Option<Address>,
    /// Token amount scaled by the filter's decimals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<Address>,
}

impl TransactionCallback {
    /// Builds the callback describing the current state of `txn`.
    pub fn from_transaction(txn: &Transaction, task_uuid: Option<Uuid>) -> Self {
        let third_party = txn.third_party.as_ref();
        Self {
            task_uuid,
            timestamp: txn.updated_at as f64 / 1000.0,
            status: txn.status,
            error: txn.error.clone(),
            message: txn.message.clone(),
            hash: txn.hash,
            sender_address: third_party.map(|t| t.sender),
            recipient_address: third_party.map(|t| t.recipient),
            transfer_amount: third_party.map(|t| scale_amount(&t.amount.to_string(), t.decimals)),
            contract_address: third_party.map(|t| t.contract_address),
        }
    }

    /// Key the receiving side tracks state under.
    pub fn ledger_key(&self) -> String {
        match (self.task_uuid, self.hash) {
            (Some(uuid), _) => uuid.to_string(),
            (None, Some(hash)) => hash.to_string(),
            (None, None) => String::new(),
        }
    }
}

fn scale_amount(raw: &str, decimals: u8) -> f64 {
    raw.parse::<f64>().unwrap_or(0.0) / 10f64.powi(i32::from(decimals))
}

/// Sink for transaction callbacks.
#[async_trait]
pub trait Publisher: Send + Sync + Debug {
    async fn publish(&self, callback: &TransactionCallback) -> WorkerResult<()>;
}

/// Publishes the current state of `txn`.
///
/// Delivery failures are logged and swallowed: the row is already committed
/// and the next mutation publishes a newer state.
pub async fn publish_transaction(publisher: &dyn Publisher, store: &Store, txn: &Transaction) {
    let task_uuid = txn
        .task_id
        .and_then(|id| store.task(id).ok())
        .map(|task| task.uuid);
    let callback = TransactionCallback::from_transaction(txn, task_uuid);
    if let Err(err) = publisher.publish(&callback).await {
        warn!(
            txn_id = txn.id,
            task_uuid = ?task_uuid,
            error = %err.sanitized_message(),
            "Failed to publish transaction callback"
        );
    }
}

/// Publisher that only logs. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, callback: &TransactionCallback) -> WorkerResult<()> {
        debug!(
            task_uuid = ?callback.task_uuid,
            status = %callback.status,
            hash = ?callback.hash,
            "No webhook configured, dropping callback"
        );
        Ok(())
    }
}

/// Publishes callbacks to the application over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    endpoint: Url,
    username: String,
    secret: String,
    retry: RetryExecutor,
}

impl WebhookPublisher {
    /// Creates a publisher for `endpoint`.
    ///
    /// An endpoint without a path gets [`DEFAULT_CALLBACK_PATH`].
    pub fn new(
        mut endpoint: Url,
        username: impl Into<String>,
        secret: impl Into<String>,
        timeout: Duration,
        retry: RetryExecutor,
    ) -> WorkerResult<Self> {
        if endpoint.path().is_empty() || endpoint.path() == "/" {
            endpoint.set_path(DEFAULT_CALLBACK_PATH);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            username: username.into(),
            secret: secret.into(),
            retry,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post_once(&self, callback: &TransactionCallback) -> WorkerResult<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .basic_auth(&self.username, Some(&self.secret))
            .json(callback)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(WorkerError::Webhook {
            status_code: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, callback: &TransactionCallback) -> WorkerResult<()> {
        self.retry.execute(|| self.post_once(callback)).await?;
        debug!(
            task_uuid = ?callback.task_uuid,
            status = %callback.status,
            "Delivered transaction callback"
        );
        Ok(())
    }
}

/// Latest callback state per task, ordered by callback timestamp.
#[derive(Debug, Default)]
pub struct CallbackLedger {
    entries: Mutex<HashMap<String, TransactionCallback>>,
}

impl CallbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `callback` unless a callback with a later timestamp is already
    /// recorded for the same key. Returns whether it was recorded.
    pub fn apply(&self, callback: TransactionCallback) -> bool {
        let key = callback.ledger_key();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            if existing.timestamp > callback.timestamp {
                info!(
                    key = %key,
                    recorded = existing.timestamp,
                    received = callback.timestamp,
                    "Ignoring stale callback"
                );
                return false;
            }
        }
        entries.insert(key, callback);
        true
    }

    pub fn get(&self, key: &str) -> Option<TransactionCallback> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ThirdPartyTransfer;
    use alloy::primitives::U256;

    fn callback(uuid: Uuid, timestamp: f64, status: TransactionStatus) -> TransactionCallback {
        TransactionCallback {
            task_uuid: Some(uuid),
            timestamp,
            status,
            error: None,
            message: None,
            hash: Some(B256::repeat_byte(0xab)),
            sender_address: None,
            recipient_address: None,
            transfer_amount: None,
            contract_address: None,
        }
    }

    #[test]
    fn test_later_timestamp_wins_regardless_of_order() {
        let ledger = CallbackLedger::new();
        let uuid = Uuid::new_v4();

        assert!(ledger.apply(callback(uuid, 20.0, TransactionStatus::Success)));
        assert!(!ledger.apply(callback(uuid, 10.0, TransactionStatus::Pending)));
        assert_eq!(
            ledger.get(&uuid.to_string()).unwrap().status,
            TransactionStatus::Success
        );

        let other = Uuid::new_v4();
        assert!(ledger.apply(callback(other, 10.0, TransactionStatus::Pending)));
        assert!(ledger.apply(callback(other, 20.0, TransactionStatus::Failed)));
        assert_eq!(
            ledger.get(&other.to_string()).unwrap().status,
            TransactionStatus::Failed
        );
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_task_payload_omits_third_party_fields() {
        let uuid = Uuid::new_v4();
        let json = serde_json::to_value(callback(uuid, 1.5, TransactionStatus::Pending)).unwrap();
        assert_eq!(json["task_uuid"], uuid.to_string());
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["timestamp"], 1.5);
        assert!(json["error"].is_null());
        assert!(json.get("sender_address").is_none());
    }

    #[test]
    fn test_third_party_payload() {
        let mut txn = crate::types::Transaction {
            id: 1,
            task_id: None,
            status: TransactionStatus::Success,
            hash: Some(B256::repeat_byte(1)),
            nonce: None,
            signing_wallet_id: None,
            created_at: 0,
            submitted_at: None,
            mined_at: None,
            block_number: Some(10),
            contract_address: None,
            error: None,
            message: None,
            nonce_consumed: false,
            ignore: true,
            updated_at: 2_500,
            third_party: None,
        };
        txn.third_party = Some(ThirdPartyTransfer {
            filter_id: 1,
            sender: Address::repeat_byte(2),
            recipient: Address::repeat_byte(3),
            amount: U256::from(1_500_000u64),
            decimals: 6,
            contract_address: Address::repeat_byte(4),
            log_index: 0,
            webhook_delivered: false,
        });

        let cb = TransactionCallback::from_transaction(&txn, None);
        assert_eq!(cb.timestamp, 2.5);
        assert_eq!(cb.transfer_amount, Some(1.5));
        assert_eq!(cb.sender_address, Some(Address::repeat_byte(2)));
        assert_eq!(cb.ledger_key(), B256::repeat_byte(1).to_string());

        let body = serde_json::to_value(&cb).unwrap();
        assert_eq!(body["task_uuid"], serde_json::Value::Null);
        assert_eq!(body["hash"], serde_json::json!(B256::repeat_byte(1).to_string()));
    }

    #[test]
    fn test_endpoint_gets_default_path() {
        let publisher = WebhookPublisher::new(
            Url::parse("http://app.internal:9000").unwrap(),
            "worker",
            "s3cret",
            Duration::from_secs(5),
            RetryExecutor::with_defaults(),
        )
        .unwrap();
        assert_eq!(publisher.endpoint().path(), DEFAULT_CALLBACK_PATH);

        let custom = WebhookPublisher::new(
            Url::parse("http://app.internal/hooks/eth").unwrap(),
            "worker",
            "s3cret",
            Duration::from_secs(5),
            RetryExecutor::with_defaults(),
        )
        .unwrap();
        assert_eq!(custom.endpoint().path(), "/hooks/eth");
    }
}
