//! Access to the EVM node.
//!
//! Everything the worker needs from the chain goes through [`ChainClient`],
//! so tests can drive the supervisor with a scripted chain. The production
//! implementation is [`RpcChainClient`].
//!
//! Implementations classify failures: a node that answers with a JSON-RPC
//! error (revert during estimation, nonce too low, insufficient funds) yields
//! [`WorkerError::PreBlockchain`](crate::error::WorkerError::PreBlockchain),
//! while transport trouble yields
//! [`WorkerError::Rpc`](crate::error::WorkerError::Rpc).

pub mod abi;
mod rpc;

pub use rpc::RpcChainClient;

use crate::error::WorkerResult;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;

/// Event signature of ERC20 transfers.
pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// `topic0` of ERC20 transfer logs.
pub fn transfer_topic() -> B256 {
    keccak256(TRANSFER_EVENT_SIGNATURE)
}

/// A call or deployment to estimate or execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

/// The parts of a receipt the worker acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub success: bool,
    /// `None` while the receipt is not attached to a block yet.
    pub block_number: Option<u64>,
    pub contract_address: Option<Address>,
}

/// Transfer-log query over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub from_block: u64,
    pub to_block: u64,
    /// Restricts `topic1` (sender). Empty matches any.
    pub senders: Vec<Address>,
    /// Restricts `topic2` (recipient). Empty matches any.
    pub recipients: Vec<Address>,
}

/// A raw log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

/// Trait seam over the JSON-RPC node.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn chain_id(&self) -> WorkerResult<u64>;

    /// Pending-inclusive transaction count of `address`.
    async fn transaction_count(&self, address: Address) -> WorkerResult<u64>;

    async fn balance(&self, address: Address) -> WorkerResult<U256>;

    /// Gas price in wei.
    async fn gas_price(&self) -> WorkerResult<u128>;

    async fn estimate_gas(&self, request: &CallRequest) -> WorkerResult<u64>;

    /// Read-only `eth_call` at the latest block.
    async fn call(&self, request: &CallRequest) -> WorkerResult<Bytes>;

    /// Broadcasts a signed, EIP-2718 encoded transaction.
    async fn send_raw_transaction(&self, raw: Bytes) -> WorkerResult<B256>;

    async fn transaction_receipt(&self, hash: B256) -> WorkerResult<Option<ReceiptSummary>>;

    async fn block_number(&self) -> WorkerResult<u64>;

    /// Transfer logs matching `query`.
    async fn transfer_logs(&self, query: &LogQuery) -> WorkerResult<Vec<LogEntry>>;
}
