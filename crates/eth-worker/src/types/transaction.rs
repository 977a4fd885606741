use super::{FilterId, TaskId, Timestamp, TransactionStatus, WalletId};
use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// Internal, monotonically assigned transaction id.
pub type TransactionId = u64;

/// One concrete on-chain submission, or a transfer observed on chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// `None` for third-party records.
    pub task_id: Option<TaskId>,
    pub status: TransactionStatus,
    pub hash: Option<B256>,
    pub nonce: Option<u64>,
    pub signing_wallet_id: Option<WalletId>,
    pub created_at: Timestamp,
    pub submitted_at: Option<Timestamp>,
    pub mined_at: Option<Timestamp>,
    pub block_number: Option<u64>,
    pub contract_address: Option<Address>,
    pub error: Option<String>,
    pub message: Option<String>,
    /// Set once the chain has used this nonce (mined, success or revert).
    pub nonce_consumed: bool,
    /// Ignored rows never count toward the nonce set.
    pub ignore: bool,
    /// Last mutation time, sent as the webhook timestamp.
    pub updated_at: Timestamp,
    pub third_party: Option<ThirdPartyTransfer>,
}

impl Transaction {
    /// A fresh pending attempt without a nonce.
    pub(crate) fn attempt(
        id: TransactionId,
        task_id: TaskId,
        signing_wallet_id: WalletId,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            task_id: Some(task_id),
            status: TransactionStatus::Pending,
            hash: None,
            nonce: None,
            signing_wallet_id: Some(signing_wallet_id),
            created_at: now,
            submitted_at: None,
            mined_at: None,
            block_number: None,
            contract_address: None,
            error: None,
            message: None,
            nonce_consumed: false,
            ignore: false,
            updated_at: now,
            third_party: None,
        }
    }

    /// Whether this row was discovered by the sync scanner.
    pub fn is_third_party(&self) -> bool {
        self.third_party.is_some()
    }

    /// Whether the row holds a nonce other attempts must not reuse.
    pub fn holds_nonce(&self) -> bool {
        !self.ignore
            && self.nonce.is_some()
            && (self.status == TransactionStatus::Pending || self.nonce_consumed)
    }
}

/// Details of a transfer log picked up by the sync scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThirdPartyTransfer {
    pub filter_id: FilterId,
    pub sender: Address,
    pub recipient: Address,
    /// Raw token amount.
    pub amount: U256,
    pub decimals: u8,
    pub contract_address: Address,
    pub log_index: u64,
    pub webhook_delivered: bool,
}
