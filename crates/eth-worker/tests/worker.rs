mod common;

use alloy::primitives::{Address, U256};
use common::{MockChain, RecordingPublisher, CHAIN_ID, MINED_BLOCK};
use eth_worker::api::{TaskRequest, TaskResponse};
use eth_worker::retry::PollBackoff;
use eth_worker::store::Store;
use eth_worker::types::TaskStatus;
use eth_worker::{EthWorker, EthWorkerBuilder, KeyCipher, WorkerConfig};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn build_worker(chain: Arc<MockChain>, snapshot: Option<&Path>) -> EthWorker {
    let mut config = WorkerConfig::default()
        .with_chain_id(CHAIN_ID)
        .with_encryption_key(KeyCipher::generate_key())
        .with_poll(PollBackoff {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        });
    if let Some(path) = snapshot {
        config = config.with_snapshot_path(path);
    }
    EthWorkerBuilder::new(config)
        .with_chain_client(chain)
        .with_publisher(Arc::new(RecordingPublisher::default()))
        .build()
        .await
        .unwrap()
}

async fn wait_for_status(worker: &EthWorker, uuid: Uuid, status: TaskStatus) -> TaskResponse {
    for _ in 0..200 {
        let response = worker.handle_request(TaskRequest::GetTask { uuid }).await;
        if let TaskResponse::Task(view) = &response {
            if view.status == status {
                return response;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {uuid} never reached {status}");
}

#[tokio::test]
async fn test_worker_runs_requests() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("store.json");
    let chain = Arc::new(MockChain::default());
    let worker = build_worker(chain.clone(), Some(&snapshot)).await;
    let handle = worker.start().unwrap();

    let created = worker
        .handle_request(TaskRequest::CreateWallet {
            private_key: None,
            allow_existing: false,
            target_balance: U256::ZERO,
            topup_threshold: U256::ZERO,
        })
        .await;
    let TaskResponse::WalletCreated { address, .. } = created else {
        panic!("unexpected response {created:?}");
    };

    let uuid = Uuid::new_v4();
    let request: TaskRequest = serde_json::from_value(json!({
        "type": "send_value",
        "uuid": uuid,
        "recipient": Address::repeat_byte(0x42).to_string(),
        "amount": "1000",
        "signing_address": address.to_string(),
    }))
    .unwrap();
    let response = worker.handle_request(request).await;
    assert!(matches!(response, TaskResponse::TaskCreated { .. }), "{response:?}");

    let TaskResponse::Task(view) = wait_for_status(&worker, uuid, TaskStatus::Success).await else {
        unreachable!();
    };
    assert_eq!(view.successful_block, Some(MINED_BLOCK));
    assert_eq!(chain.sent_count(), 1);

    worker.stop().unwrap();
    worker.wait().await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(worker.stop().is_err());

    let restored = Store::load_snapshot(&snapshot).unwrap();
    assert_eq!(
        restored.task_status(restored.task_by_uuid(&uuid).unwrap().id).unwrap(),
        TaskStatus::Success
    );
}

#[tokio::test]
async fn test_worker_reports_errors() {
    let worker = build_worker(Arc::new(MockChain::default()), None).await;

    let response = worker
        .handle_request(TaskRequest::GetTask {
            uuid: Uuid::new_v4(),
        })
        .await;
    let TaskResponse::Error { kind, .. } = response else {
        panic!("unexpected response {response:?}");
    };
    assert_eq!(kind, "TaskNotFound");

    // Signing with an unknown wallet.
    let response = worker
        .handle_request(TaskRequest::SendValue {
            uuid: Uuid::new_v4(),
            recipient: Address::repeat_byte(1),
            amount: U256::from(1u64),
            signing_address: Some(Address::repeat_byte(2)),
            encrypted_private_key: None,
            prior_tasks: Vec::new(),
            posterior_tasks: Vec::new(),
        })
        .await;
    let TaskResponse::Error { kind, .. } = response else {
        panic!("unexpected response {response:?}");
    };
    assert_eq!(kind, "WalletNotFound");
}

#[tokio::test]
async fn test_worker_cannot_start_twice() {
    let worker = build_worker(Arc::new(MockChain::default()), None).await;
    let first = worker.start().unwrap();
    let second = worker.start().unwrap();
    // Only one loop can own the job queue.
    assert!(second.await.unwrap().is_err());

    worker.stop().unwrap();
    worker.wait().await.unwrap();
    first.await.unwrap().unwrap();
}
