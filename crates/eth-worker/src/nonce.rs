//! Nonce allocation.
//!
//! Nonces are handed out under a per-wallet lock so two concurrent
//! submissions from one wallet never share a nonce, while gaps left by failed
//! attempts are refilled before the sequence grows. The chain's
//! pending-inclusive transaction count is the floor.

use crate::chain::ChainClient;
use crate::error::{WorkerError, WorkerResult};
use crate::lock::Locks;
use crate::store::Store;
use crate::types::{now_millis, TransactionId, Wallet};
use crate::webhook::{publish_transaction, Publisher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Timing knobs for nonce claims.
#[derive(Debug, Clone, Copy)]
pub struct NonceSettings {
    /// Pending rows older than this are swept to FAILED.
    pub pending_expiry: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
}

impl Default for NonceSettings {
    fn default() -> Self {
        Self {
            pending_expiry: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_secs(5),
        }
    }
}

/// Lock key guarding a wallet's nonce space.
pub fn nonce_lock_key(wallet: &Wallet) -> String {
    format!("TransactionNonceLock-{}", wallet.id)
}

/// Reserves nonces for transaction rows.
#[derive(Clone)]
pub struct NonceAllocator {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    locks: Locks,
    publisher: Arc<dyn Publisher>,
    settings: NonceSettings,
}

impl NonceAllocator {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        locks: Locks,
        publisher: Arc<dyn Publisher>,
        settings: NonceSettings,
    ) -> Self {
        Self {
            store,
            chain,
            locks,
            publisher,
            settings,
        }
    }

    /// Reserves the lowest free nonce for `txn_id`, signed by `wallet`.
    ///
    /// Fails with [`WorkerError::LockNotAcquired`] if another claim for the
    /// same wallet holds the lock for longer than the configured wait; the
    /// caller retries the whole claim.
    pub async fn claim(&self, wallet: &Wallet, txn_id: TransactionId) -> WorkerResult<(u64, TransactionId)> {
        let network_nonce = self.chain.transaction_count(wallet.address).await?;

        let key = nonce_lock_key(wallet);
        let guard = self
            .locks
            .acquire(&key, self.settings.lock_ttl, self.settings.lock_wait)
            .await
            .ok_or_else(|| WorkerError::LockNotAcquired(key.clone()))?;

        let claim = self.store.claim_nonce(
            wallet.id,
            txn_id,
            network_nonce,
            now_millis(),
            self.settings.pending_expiry.as_millis() as u64,
        )?;
        drop(guard);

        if !claim.expired.is_empty() {
            warn!(
                expired = ?claim.expired,
                "Swept pending transactions past their expiry"
            );
            for id in &claim.expired {
                if let Ok(txn) = self.store.transaction(*id) {
                    publish_transaction(self.publisher.as_ref(), &self.store, &txn).await;
                }
            }
        }
        if claim.unconsumed > 0 {
            info!(
                wallet_id = wallet.id,
                released = claim.unconsumed,
                "Released nonces of failed transactions above the last success"
            );
        }
        info!(
            wallet_id = wallet.id,
            address = %wallet.address,
            txn_id,
            nonce = claim.nonce,
            network_nonce,
            "Claimed nonce"
        );
        Ok((claim.nonce, txn_id))
    }
}
