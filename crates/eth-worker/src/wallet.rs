//! Signing identities.

use crate::crypto::KeyCipher;
use crate::error::{WorkerError, WorkerResult};
use crate::store::Store;
use crate::types::{TopupPolicy, Wallet, WalletId};
use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// How a request names its signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletRef {
    Address(Address),
    EncryptedKey(String),
}

impl WalletRef {
    /// Picks the address if present, otherwise the encrypted key.
    pub fn from_parts(
        signing_address: Option<Address>,
        encrypted_private_key: Option<String>,
    ) -> WorkerResult<Self> {
        match (signing_address, encrypted_private_key) {
            (Some(address), _) => Ok(Self::Address(address)),
            (None, Some(key)) => Ok(Self::EncryptedKey(key)),
            (None, None) => Err(WorkerError::InvalidAddress(
                "either signing_address or encrypted_private_key is required".to_string(),
            )),
        }
    }
}

/// Creates, resolves and decrypts wallets.
#[derive(Debug, Clone)]
pub struct WalletStore {
    store: Arc<Store>,
    cipher: Arc<KeyCipher>,
}

impl WalletStore {
    pub fn new(store: Arc<Store>, cipher: Arc<KeyCipher>) -> Self {
        Self { store, cipher }
    }

    /// Creates a wallet from a hex private key, or from a fresh random key
    /// when none is given.
    pub fn create_wallet(
        &self,
        private_key: Option<&str>,
        allow_existing: bool,
        topup: TopupPolicy,
    ) -> WorkerResult<Wallet> {
        let signer = match private_key {
            Some(key) => parse_private_key(key)?,
            None => PrivateKeySigner::random(),
        };
        self.insert(&signer, allow_existing, topup)
    }

    fn insert(
        &self,
        signer: &PrivateKeySigner,
        allow_existing: bool,
        topup: TopupPolicy,
    ) -> WorkerResult<Wallet> {
        let address = signer.address();
        let wallet = self.store.insert_wallet(address, allow_existing, |id| {
            Wallet::from_private_key(id, signer, &self.cipher, topup)
        })?;
        info!(wallet_id = wallet.id, address = %wallet.address, "Wallet ready");
        Ok(wallet)
    }

    /// Resolves the wallet a task signs with.
    ///
    /// An encrypted key that is not yet known creates its wallet on the fly.
    pub fn get_signing_wallet(&self, wallet: &WalletRef) -> WorkerResult<Wallet> {
        match wallet {
            WalletRef::Address(address) => self
                .store
                .wallet_by_address(address)
                .ok_or_else(|| WorkerError::WalletNotFound(address.to_string())),
            WalletRef::EncryptedKey(encrypted) => {
                if let Some(wallet) = self.store.wallet_by_encrypted_key(encrypted) {
                    return Ok(wallet);
                }
                let key = self.cipher.decrypt(encrypted)?;
                let signer = PrivateKeySigner::from_slice(&key)
                    .map_err(|e| WorkerError::InvalidPrivateKey(e.to_string()))?;
                self.insert(&signer, true, TopupPolicy::default())
            }
        }
    }

    pub fn wallet(&self, id: WalletId) -> WorkerResult<Wallet> {
        self.store.wallet(id)
    }

    /// Decrypts the wallet's key for a single signing operation.
    pub fn signer(&self, wallet: &Wallet) -> WorkerResult<PrivateKeySigner> {
        let key = self.cipher.decrypt(&wallet.encrypted_private_key)?;
        let signer = PrivateKeySigner::from_slice(&key)
            .map_err(|e| WorkerError::InvalidPrivateKey(e.to_string()))?;
        if signer.address() != wallet.address {
            return Err(WorkerError::Encryption(format!(
                "decrypted key does not match wallet {}",
                wallet.address
            )));
        }
        Ok(signer)
    }

    /// Sets the balance levels that trigger automatic top-ups.
    pub fn set_topup_policy(
        &self,
        address: &Address,
        target_balance: U256,
        topup_threshold: U256,
    ) -> WorkerResult<Wallet> {
        let wallet = self
            .store
            .wallet_by_address(address)
            .ok_or_else(|| WorkerError::WalletNotFound(address.to_string()))?;
        self.store.update_wallet(wallet.id, |w| {
            w.topup = TopupPolicy {
                target_balance,
                topup_threshold,
            }
        })
    }
}

/// Parses a hex private key, with or without `0x`.
pub fn parse_private_key(key: &str) -> WorkerResult<PrivateKeySigner> {
    PrivateKeySigner::from_str(key.trim())
        .map_err(|_| WorkerError::InvalidPrivateKey("not a 32-byte hex key".to_string()))
}
