//! Receipt polling for broadcast transactions.

use crate::chain::ChainClient;
use crate::error::WorkerResult;
use crate::store::{Store, TIMEOUT_ERROR};
use crate::types::{now_millis, Timestamp, Transaction, TransactionId, TransactionStatus};
use crate::webhook::{publish_transaction, Publisher};
use alloy::primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Error recorded on rows whose receipt reports a revert.
pub const BLOCKCHAIN_ERROR: &str = "Blockchain Error";

/// Result of one status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationStatus {
    pub status: TransactionStatus,
    pub block_number: Option<u64>,
    pub mined_at: Option<Timestamp>,
    pub contract_address: Option<Address>,
}

impl ConfirmationStatus {
    fn of(txn: &Transaction) -> Self {
        Self {
            status: txn.status,
            block_number: txn.block_number,
            mined_at: txn.mined_at,
            contract_address: txn.contract_address,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Success | TransactionStatus::Failed
        )
    }
}

/// Checks transaction rows against the chain and records the outcome.
#[derive(Clone)]
pub struct ConfirmationPoller {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    publisher: Arc<dyn Publisher>,
    pending_expiry: Duration,
}

impl ConfirmationPoller {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        publisher: Arc<dyn Publisher>,
        pending_expiry: Duration,
    ) -> Self {
        Self {
            store,
            chain,
            publisher,
            pending_expiry,
        }
    }

    /// Checks `txn_id` once.
    ///
    /// Rows that are no longer PENDING are reported as recorded. RPC errors
    /// are returned unchanged and leave the row untouched.
    pub async fn check_status(&self, txn_id: TransactionId) -> WorkerResult<ConfirmationStatus> {
        let txn = self.store.transaction(txn_id)?;
        if txn.status != TransactionStatus::Pending {
            return Ok(ConfirmationStatus::of(&txn));
        }

        let Some(hash) = txn.hash else {
            return self.pending_or_expired(txn).await;
        };

        let receipt = match self.chain.transaction_receipt(hash).await? {
            Some(receipt) if receipt.block_number.is_some() => receipt,
            _ => {
                debug!(txn_id, hash = %hash, "No receipt yet");
                return self.pending_or_expired(txn).await;
            }
        };

        let now = now_millis();
        let updated = if receipt.success {
            self.store.update_transaction(txn_id, |t| {
                t.status = TransactionStatus::Success;
                t.block_number = receipt.block_number;
                t.mined_at = Some(now);
                t.contract_address = receipt.contract_address;
                t.nonce_consumed = true;
                t.error = None;
                t.message = None;
            })?
        } else {
            self.store.update_transaction(txn_id, |t| {
                t.status = TransactionStatus::Failed;
                t.block_number = receipt.block_number;
                t.mined_at = Some(now);
                t.nonce_consumed = true;
                t.error = Some(BLOCKCHAIN_ERROR.to_string());
                t.message = Some(format!("Transaction {hash} reverted"));
            })?
        };
        info!(
            txn_id,
            hash = %hash,
            status = %updated.status,
            block_number = ?updated.block_number,
            "Transaction mined"
        );
        publish_transaction(self.publisher.as_ref(), &self.store, &updated).await;
        Ok(ConfirmationStatus::of(&updated))
    }

    async fn pending_or_expired(&self, txn: Transaction) -> WorkerResult<ConfirmationStatus> {
        let expiry = self.pending_expiry.as_millis() as u64;
        if txn.created_at.saturating_add(expiry) >= now_millis() {
            return Ok(ConfirmationStatus::of(&txn));
        }

        let updated = self.store.update_transaction(txn.id, |t| {
            t.status = TransactionStatus::Failed;
            t.error = Some(TIMEOUT_ERROR.to_string());
            t.message = Some("Transaction was not mined within the expiry window".to_string());
        })?;
        warn!(txn_id = txn.id, hash = ?txn.hash, "Pending transaction expired");
        publish_transaction(self.publisher.as_ref(), &self.store, &updated).await;
        Ok(ConfirmationStatus::of(&updated))
    }
}
