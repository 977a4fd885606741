//! Transaction submission.
//!
//! A [`TransactionSubmitter`] turns a prepared transaction row into a signed
//! legacy (EIP-155) transaction and broadcasts it. The hash, nonce and
//! submission time are written to the row *before* the broadcast, so a crash
//! or a lost response mid-broadcast can still be resolved by polling for the
//! receipt.
//!
//! Errors are classified for the supervisor:
//!
//! - transient errors (RPC transport, nonce lock contention) mean "try the
//!   submission again later";
//! - everything else that happens before or at broadcast is reported as
//!   [`WorkerError::PreBlockchain`] and fails the attempt.

use crate::chain::abi::ContractRegistry;
use crate::chain::{CallRequest, ChainClient};
use crate::error::{WorkerError, WorkerResult};
use crate::nonce::NonceAllocator;
use crate::store::Store;
use crate::types::{now_millis, TaskKind, TransactionId};
use crate::wallet::WalletStore;
use crate::webhook::{publish_transaction, Publisher};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Gas limit and price rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasSettings {
    /// Upper bound for estimated gas limits.
    pub max_gas_limit: u64,
    /// Safety margin added to node estimates, in percent.
    pub estimate_margin_percent: u64,
    /// Fixed gas price in wei. The node's price is used when unset.
    pub gas_price_override: Option<u128>,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            max_gas_limit: 8_000_000,
            estimate_margin_percent: 20,
            gas_price_override: None,
        }
    }
}

impl GasSettings {
    /// Pads a node estimate by the margin and caps it.
    pub fn padded_limit(&self, estimate: u64) -> u64 {
        let padded = estimate.saturating_mul(100 + self.estimate_margin_percent) / 100;
        padded.min(self.max_gas_limit)
    }
}

/// Signs and broadcasts transaction rows.
#[derive(Clone)]
pub struct TransactionSubmitter {
    store: Arc<Store>,
    wallets: WalletStore,
    chain: Arc<dyn ChainClient>,
    nonces: NonceAllocator,
    registry: Arc<ContractRegistry>,
    publisher: Arc<dyn Publisher>,
    gas: GasSettings,
    chain_id: u64,
}

impl TransactionSubmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        wallets: WalletStore,
        chain: Arc<dyn ChainClient>,
        nonces: NonceAllocator,
        registry: Arc<ContractRegistry>,
        publisher: Arc<dyn Publisher>,
        gas: GasSettings,
        chain_id: u64,
    ) -> Self {
        Self {
            store,
            wallets,
            chain,
            nonces,
            registry,
            publisher,
            gas,
            chain_id,
        }
    }

    /// Submits the row `txn_id` for a task of the given kind.
    pub async fn submit(&self, txn_id: TransactionId, kind: &TaskKind) -> WorkerResult<TransactionId> {
        let result = match kind {
            TaskKind::SendValue { recipient, amount } => {
                self.submit_value_transfer(txn_id, *recipient, *amount).await
            }
            TaskKind::CallFunction {
                contract_address,
                abi_kind,
                function,
                args,
                kwargs,
                gas_limit,
            } => {
                self.submit_function_call(
                    txn_id,
                    *contract_address,
                    abi_kind,
                    function,
                    args,
                    kwargs,
                    *gas_limit,
                )
                .await
            }
            TaskKind::DeployContract {
                contract_name,
                args,
                kwargs,
                gas_limit,
            } => {
                self.submit_contract_deployment(txn_id, contract_name, args, kwargs, *gas_limit)
                    .await
            }
        };
        result.map_err(classify)
    }

    pub async fn submit_value_transfer(
        &self,
        txn_id: TransactionId,
        recipient: Address,
        amount: U256,
    ) -> WorkerResult<TransactionId> {
        self.process_transaction(txn_id, Some(recipient), amount, Bytes::new(), None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn submit_function_call(
        &self,
        txn_id: TransactionId,
        contract_address: Address,
        abi_kind: &str,
        function: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        gas_limit: Option<u64>,
    ) -> WorkerResult<TransactionId> {
        let calldata = self
            .registry
            .encode_function_call(abi_kind, function, args, kwargs)?
            .calldata;
        self.process_transaction(txn_id, Some(contract_address), U256::ZERO, calldata, gas_limit)
            .await
    }

    pub async fn submit_contract_deployment(
        &self,
        txn_id: TransactionId,
        contract_name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        gas_limit: Option<u64>,
    ) -> WorkerResult<TransactionId> {
        let data = self
            .registry
            .encode_deployment(contract_name, args, kwargs)?;
        self.process_transaction(txn_id, None, U256::ZERO, data, gas_limit)
            .await
    }

    /// Read-only call. Returns the decoded outputs.
    pub async fn call_contract_function(
        &self,
        contract_address: Address,
        abi_kind: &str,
        function: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        from: Option<Address>,
    ) -> WorkerResult<Vec<Value>> {
        let call = self
            .registry
            .encode_function_call(abi_kind, function, args, kwargs)?;
        let request = CallRequest {
            from: from.unwrap_or(Address::ZERO),
            to: Some(contract_address),
            value: U256::ZERO,
            data: call.calldata.clone(),
        };
        let output = self.chain.call(&request).await?;
        call.decode_output(&output)
    }

    async fn process_transaction(
        &self,
        txn_id: TransactionId,
        to: Option<Address>,
        value: U256,
        data: Bytes,
        gas_limit: Option<u64>,
    ) -> WorkerResult<TransactionId> {
        let txn = self.store.transaction(txn_id)?;
        let wallet_id = txn
            .signing_wallet_id
            .ok_or_else(|| WorkerError::Internal(format!("transaction {txn_id} has no signer")))?;
        let wallet = self.wallets.wallet(wallet_id)?;

        let request = CallRequest {
            from: wallet.address,
            to,
            value,
            data,
        };
        let gas_limit = match gas_limit {
            Some(limit) => limit,
            None => self.gas.padded_limit(self.chain.estimate_gas(&request).await?),
        };
        let gas_price = match self.gas.gas_price_override {
            Some(price) => price,
            None => self.chain.gas_price().await?,
        };

        let (nonce, _) = self.nonces.claim(&wallet, txn_id).await?;
        let signer = self.wallets.signer(&wallet)?;
        let (hash, raw) =
            sign_legacy(signer, &request, nonce, gas_limit, gas_price, self.chain_id).await?;

        let txn = self.store.update_transaction(txn_id, |t| {
            t.hash = Some(hash);
            t.nonce = Some(nonce);
            t.submitted_at = Some(now_millis());
        })?;
        publish_transaction(self.publisher.as_ref(), &self.store, &txn).await;

        debug!(
            txn_id,
            nonce,
            gas_limit,
            gas_price,
            hash = %hash,
            "Broadcasting transaction"
        );
        match self.chain.send_raw_transaction(raw).await {
            Ok(_) => {
                info!(txn_id, nonce, hash = %hash, "Transaction broadcast");
                Ok(txn_id)
            }
            Err(err) if err.is_transient() => {
                // The hash is persisted; polling finds out whether it landed.
                warn!(
                    txn_id,
                    hash = %hash,
                    error = %err.sanitized_message(),
                    "Broadcast outcome unknown"
                );
                Ok(txn_id)
            }
            Err(err) => Err(err),
        }
    }
}

/// Non-transient failures before or at broadcast fail the attempt.
fn classify(err: WorkerError) -> WorkerError {
    if err.is_transient() || matches!(err, WorkerError::PreBlockchain(_)) {
        err
    } else {
        WorkerError::pre_blockchain(err.to_string())
    }
}

async fn sign_legacy(
    signer: PrivateKeySigner,
    request: &CallRequest,
    nonce: u64,
    gas_limit: u64,
    gas_price: u128,
    chain_id: u64,
) -> WorkerResult<(B256, Bytes)> {
    let wallet = EthereumWallet::from(signer);
    let tx = TransactionRequest::default()
        .with_from(request.from)
        .with_value(request.value)
        .with_input(request.data.clone())
        .with_nonce(nonce)
        .with_gas_limit(gas_limit)
        .with_gas_price(gas_price)
        .with_chain_id(chain_id);
    let tx = match request.to {
        Some(to) => tx.with_to(to),
        None => tx.into_create(),
    };
    let envelope = tx
        .build(&wallet)
        .await
        .map_err(|e| WorkerError::pre_blockchain(format!("signing failed: {e}")))?;
    Ok((*envelope.tx_hash(), envelope.encoded_2718().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{Transaction as _, TxEnvelope};
    use alloy::eips::eip2718::Decodable2718;

    #[test]
    fn test_padded_limit() {
        let gas = GasSettings {
            max_gas_limit: 100_000,
            estimate_margin_percent: 20,
            gas_price_override: None,
        };
        assert_eq!(gas.padded_limit(21_000), 25_200);
        assert_eq!(gas.padded_limit(90_000), 100_000);
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(WorkerError::abi("missing argument")),
            WorkerError::PreBlockchain(_)
        ));
        assert!(matches!(
            classify(WorkerError::LockNotAcquired("k".into())),
            WorkerError::LockNotAcquired(_)
        ));
        assert!(matches!(classify(WorkerError::rpc("reset")), WorkerError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_sign_legacy_is_eip155() {
        let signer = PrivateKeySigner::random();
        let from = signer.address();
        let request = CallRequest {
            from,
            to: Some(Address::repeat_byte(0x42)),
            value: U256::from(100u64),
            data: Bytes::new(),
        };
        let (hash, raw) = sign_legacy(signer, &request, 7, 21_000, 1_000_000_000, 1337)
            .await
            .unwrap();

        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).unwrap();
        assert!(envelope.is_legacy());
        assert_eq!(*envelope.tx_hash(), hash);
        assert_eq!(envelope.nonce(), 7);
        assert_eq!(envelope.gas_limit(), 21_000);
        assert_eq!(envelope.chain_id(), Some(1337));
        assert_eq!(envelope.value(), U256::from(100u64));
    }
}
