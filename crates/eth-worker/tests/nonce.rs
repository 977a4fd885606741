mod common;

use alloy::primitives::{Address, U256};
use common::Harness;
use eth_worker::lock::Locks;
use eth_worker::nonce::{NonceAllocator, NonceSettings};
use eth_worker::supervisor::CreateTask;
use eth_worker::types::{TaskKind, TransactionStatus, Wallet};
use eth_worker::wallet::WalletRef;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

struct Fixture {
    harness: Harness,
    allocator: NonceAllocator,
    wallet: Wallet,
}

fn fixture() -> Fixture {
    let harness = Harness::new();
    let allocator = NonceAllocator::new(
        harness.store.clone(),
        harness.chain.clone(),
        Locks::default(),
        harness.publisher.clone(),
        NonceSettings::default(),
    );
    let wallet = harness.wallet();
    Fixture {
        harness,
        allocator,
        wallet,
    }
}

impl Fixture {
    /// A fresh attempt row signed by the fixture wallet.
    fn attempt(&self) -> u64 {
        let task = self
            .harness
            .supervisor
            .create_task(CreateTask {
                uuid: Uuid::new_v4(),
                kind: TaskKind::SendValue {
                    recipient: Address::repeat_byte(9),
                    amount: U256::from(1u64),
                },
                signer: WalletRef::Address(self.wallet.address),
                prior_tasks: Vec::new(),
                posterior_tasks: Vec::new(),
                reverses: None,
            })
            .unwrap();
        self.harness.store.create_attempt(task.id).unwrap().id
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_unique() {
    let f = Arc::new(fixture());
    let txn_ids: Vec<_> = (0..8).map(|_| f.attempt()).collect();

    let handles: Vec<_> = txn_ids
        .into_iter()
        .map(|txn_id| {
            let f = f.clone();
            tokio::spawn(async move { f.allocator.claim(&f.wallet, txn_id).await.unwrap().0 })
        })
        .collect();

    let mut nonces = BTreeSet::new();
    for handle in handles {
        assert!(nonces.insert(handle.await.unwrap()), "nonce handed out twice");
    }
    assert_eq!(nonces, (0..8).collect());
}

#[tokio::test]
async fn test_network_count_is_the_floor() {
    let f = fixture();
    f.harness.chain.set_transaction_count(f.wallet.address, 7);

    let first = f.attempt();
    let second = f.attempt();
    assert_eq!(f.allocator.claim(&f.wallet, first).await.unwrap().0, 7);
    assert_eq!(f.allocator.claim(&f.wallet, second).await.unwrap().0, 8);
}

#[tokio::test]
async fn test_rejected_nonce_is_reused() {
    let f = fixture();
    let ids: Vec<_> = (0..3).map(|_| f.attempt()).collect();
    for (expected, id) in ids.iter().enumerate() {
        assert_eq!(
            f.allocator.claim(&f.wallet, *id).await.unwrap().0,
            expected as u64
        );
    }

    // The node rejected nonce 1 before it was mined.
    f.harness
        .store
        .update_transaction(ids[1], |t| {
            t.status = TransactionStatus::Failed;
            t.nonce_consumed = false;
        })
        .unwrap();

    let next = f.attempt();
    assert_eq!(f.allocator.claim(&f.wallet, next).await.unwrap().0, 1);
    let after = f.attempt();
    assert_eq!(f.allocator.claim(&f.wallet, after).await.unwrap().0, 3);
}

#[tokio::test]
async fn test_mined_failure_keeps_its_nonce() {
    let f = fixture();
    let first = f.attempt();
    assert_eq!(f.allocator.claim(&f.wallet, first).await.unwrap().0, 0);

    f.harness
        .store
        .update_transaction(first, |t| {
            t.status = TransactionStatus::Failed;
            t.nonce_consumed = true;
        })
        .unwrap();

    let second = f.attempt();
    assert_eq!(f.allocator.claim(&f.wallet, second).await.unwrap().0, 1);
}

#[tokio::test]
async fn test_ignored_rows_free_their_nonce() {
    let f = fixture();
    let first = f.attempt();
    assert_eq!(f.allocator.claim(&f.wallet, first).await.unwrap().0, 0);
    f.harness.store.ignore_transaction(first).unwrap();

    let second = f.attempt();
    assert_eq!(f.allocator.claim(&f.wallet, second).await.unwrap().0, 0);
}
