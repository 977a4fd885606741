use super::{CallRequest, ChainClient, LogEntry, LogQuery, ReceiptSummary};
use crate::error::{WorkerError, WorkerResult};
use alloy::network::ReceiptResponse;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, TransactionInput, TransactionRequest};
use alloy::transports::TransportError;
use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

/// [`ChainClient`] backed by an HTTP JSON-RPC endpoint.
#[derive(Clone)]
pub struct RpcChainClient {
    provider: DynProvider,
    url: Url,
}

impl std::fmt::Debug for RpcChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChainClient")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl RpcChainClient {
    pub fn new(url: Url) -> Self {
        let provider = ProviderBuilder::new().connect_http(url.clone()).erased();
        Self { provider, url }
    }

    /// Parses `url` and connects.
    pub fn from_url_str(url: &str) -> WorkerResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| WorkerError::Config(format!("invalid rpc_url {url}: {e}")))?;
        Ok(Self::new(url))
    }
}

/// A node that answered with a JSON-RPC error rejected the request itself.
fn rejection_or_transport(err: TransportError) -> WorkerError {
    match err.as_error_resp() {
        Some(payload) => WorkerError::pre_blockchain(payload.message.to_string()),
        None => WorkerError::rpc(err),
    }
}

fn to_transaction_request(request: &CallRequest) -> TransactionRequest {
    let mut tx = TransactionRequest::default();
    tx.from = Some(request.from);
    tx.to = Some(match request.to {
        Some(to) => TxKind::Call(to),
        None => TxKind::Create,
    });
    tx.value = Some(request.value);
    tx.input = TransactionInput::new(request.data.clone());
    tx
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn chain_id(&self) -> WorkerResult<u64> {
        self.provider.get_chain_id().await.map_err(WorkerError::rpc)
    }

    async fn transaction_count(&self, address: Address) -> WorkerResult<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(WorkerError::rpc)
    }

    async fn balance(&self, address: Address) -> WorkerResult<U256> {
        self.provider
            .get_balance(address)
            .await
            .map_err(WorkerError::rpc)
    }

    async fn gas_price(&self) -> WorkerResult<u128> {
        self.provider.get_gas_price().await.map_err(WorkerError::rpc)
    }

    async fn estimate_gas(&self, request: &CallRequest) -> WorkerResult<u64> {
        self.provider
            .estimate_gas(to_transaction_request(request))
            .await
            .map_err(rejection_or_transport)
    }

    async fn call(&self, request: &CallRequest) -> WorkerResult<Bytes> {
        self.provider
            .call(to_transaction_request(request))
            .await
            .map_err(rejection_or_transport)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> WorkerResult<B256> {
        let pending = self
            .provider
            .send_raw_transaction(&raw)
            .await
            .map_err(rejection_or_transport)?;
        let hash = *pending.tx_hash();
        debug!(hash = %hash, "Broadcast accepted by node");
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> WorkerResult<Option<ReceiptSummary>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(WorkerError::rpc)?;
        Ok(receipt.map(|r| ReceiptSummary {
            success: r.status(),
            block_number: r.block_number,
            contract_address: r.contract_address,
        }))
    }

    async fn block_number(&self) -> WorkerResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(WorkerError::rpc)
    }

    async fn transfer_logs(&self, query: &LogQuery) -> WorkerResult<Vec<LogEntry>> {
        let mut filter = Filter::new()
            .address(query.address)
            .event_signature(super::transfer_topic())
            .from_block(query.from_block)
            .to_block(query.to_block);
        if !query.senders.is_empty() {
            filter = filter.topic1(
                query
                    .senders
                    .iter()
                    .map(|a| a.into_word())
                    .collect::<Vec<B256>>(),
            );
        }
        if !query.recipients.is_empty() {
            filter = filter.topic2(
                query
                    .recipients
                    .iter()
                    .map(|a| a.into_word())
                    .collect::<Vec<B256>>(),
            );
        }

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(WorkerError::rpc)?;

        let mut entries = Vec::with_capacity(logs.len());
        for log in logs {
            let (Some(transaction_hash), Some(log_index), Some(block_number)) =
                (log.transaction_hash, log.log_index, log.block_number)
            else {
                warn!(address = %query.address, "Skipping log without position (pending block?)");
                continue;
            };
            entries.push(LogEntry {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number,
                transaction_hash,
                log_index,
            });
        }
        Ok(entries)
    }
}
