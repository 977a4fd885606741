use super::{now_millis, Timestamp};
use crate::crypto::KeyCipher;
use crate::error::WorkerResult;
use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Internal, monotonically assigned wallet id.
pub type WalletId = u64;

/// Balance levels that trigger an automatic top-up from the master wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupPolicy {
    /// Balance to refill to, in wei.
    pub target_balance: U256,
    /// Refill once the balance is at or below this, in wei.
    pub topup_threshold: U256,
}

impl TopupPolicy {
    /// Whether a wallet holding `balance` needs a top-up, and how much.
    pub fn shortfall(&self, balance: U256) -> Option<U256> {
        (balance <= self.topup_threshold && self.target_balance > balance)
            .then(|| self.target_balance - balance)
    }

    /// Whether the policy can ever trigger.
    pub fn is_active(&self) -> bool {
        !self.target_balance.is_zero()
    }
}

/// A signing identity.
///
/// The address is always derived from the private key. Build wallets through
/// [`Wallet::from_private_key`] only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub address: Address,
    /// base64(nonce || AES-256-GCM ciphertext) of the raw 32-byte key.
    pub encrypted_private_key: String,
    pub topup: TopupPolicy,
    pub last_topup_task: Option<Uuid>,
    pub created_at: Timestamp,
}

impl Wallet {
    /// Derives the address from `signer` and encrypts its key with `cipher`.
    pub fn from_private_key(
        id: WalletId,
        signer: &PrivateKeySigner,
        cipher: &KeyCipher,
        topup: TopupPolicy,
    ) -> WorkerResult<Self> {
        let encrypted_private_key = cipher.encrypt(signer.to_bytes().as_slice())?;
        Ok(Self {
            id,
            address: signer.address(),
            encrypted_private_key,
            topup,
            last_topup_task: None,
            created_at: now_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topup_shortfall() {
        let policy = TopupPolicy {
            target_balance: U256::from(1_000u64),
            topup_threshold: U256::from(200u64),
        };
        assert_eq!(policy.shortfall(U256::from(150u64)), Some(U256::from(850u64)));
        assert_eq!(policy.shortfall(U256::from(200u64)), Some(U256::from(800u64)));
        assert_eq!(policy.shortfall(U256::from(201u64)), None);
        assert!(TopupPolicy::default().shortfall(U256::ZERO).is_none());
    }

    #[test]
    fn test_address_is_derived_from_key() {
        let cipher = KeyCipher::new(&[7u8; 32]);
        let signer = PrivateKeySigner::random();
        let wallet = Wallet::from_private_key(1, &signer, &cipher, TopupPolicy::default()).unwrap();
        assert_eq!(wallet.address, signer.address());

        let decrypted = cipher.decrypt(&wallet.encrypted_private_key).unwrap();
        assert_eq!(decrypted.as_slice(), signer.to_bytes().as_slice());
    }
}
