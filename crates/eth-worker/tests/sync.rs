mod common;

use alloy::primitives::{Address, Bytes, B256, U256};
use common::{MockChain, RecordingPublisher};
use eth_worker::chain::{transfer_topic, LogEntry};
use eth_worker::lock::Locks;
use eth_worker::store::Store;
use eth_worker::sync::{SyncSettings, ThirdPartySyncScanner};
use eth_worker::types::{BlockRangeStatus, FilterKind, TransactionStatus};
use serde_json::json;
use std::sync::Arc;

const TOKEN: Address = Address::repeat_byte(0x70);

struct Fixture {
    store: Arc<Store>,
    chain: Arc<MockChain>,
    publisher: Arc<RecordingPublisher>,
    scanner: ThirdPartySyncScanner,
}

fn fixture() -> Fixture {
    let store = Arc::new(Store::new());
    let chain = Arc::new(MockChain::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let scanner = ThirdPartySyncScanner::new(
        store.clone(),
        chain.clone(),
        publisher.clone(),
        Locks::default(),
        SyncSettings {
            chunk_size: 10,
            max_chunks_per_run: 100,
            ..Default::default()
        },
    );
    Fixture {
        store,
        chain,
        publisher,
        scanner,
    }
}

fn transfer_log(block_number: u64, hash_byte: u8, amount: u64) -> LogEntry {
    LogEntry {
        address: TOKEN,
        topics: vec![
            transfer_topic(),
            Address::repeat_byte(0x01).into_word(),
            Address::repeat_byte(0x02).into_word(),
        ],
        data: Bytes::from(U256::from(amount).to_be_bytes_vec()),
        block_number,
        transaction_hash: B256::repeat_byte(hash_byte),
        log_index: 0,
    }
}

#[tokio::test]
async fn test_sync_delivers_transfers_once() {
    let f = fixture();
    f.chain.set_head(35);
    f.chain.push_log(transfer_log(12, 0xa1, 1_500_000));
    f.chain.push_log(transfer_log(31, 0xa2, 2_000_000));

    let filter = f
        .scanner
        .add_watch_filter(TOKEN, None, FilterKind::Transfer, 6, Some(10))
        .unwrap();

    let summary = f.scanner.sync().await.unwrap();
    assert_eq!(summary.filters, 1);
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.transfers, 2);
    assert_eq!(summary.delivered, 2);
    assert!(summary.failed.is_empty());

    let callbacks = f.publisher.callbacks();
    assert_eq!(callbacks.len(), 2);
    assert_eq!(callbacks[0].task_uuid, None);
    assert_eq!(callbacks[0].status, TransactionStatus::Success);
    assert_eq!(callbacks[0].sender_address, Some(Address::repeat_byte(0x01)));
    assert_eq!(callbacks[0].recipient_address, Some(Address::repeat_byte(0x02)));
    assert_eq!(callbacks[0].transfer_amount, Some(1.5));
    assert_eq!(callbacks[0].contract_address, Some(TOKEN));

    assert_eq!(f.store.filter(filter.id).unwrap().max_block, Some(35));
    let ranges = f.store.synchronized_blocks(filter.id);
    assert!(ranges
        .iter()
        .all(|range| range.status == BlockRangeStatus::Success));

    // Nothing new: no further deliveries.
    f.chain.set_head(40);
    let summary = f.scanner.sync().await.unwrap();
    assert_eq!(summary.transfers, 0);
    assert_eq!(f.publisher.callbacks().len(), 2);
    assert_eq!(f.store.filter(filter.id).unwrap().max_block, Some(40));
}

#[tokio::test]
async fn test_failed_chunk_stops_the_filter() {
    let f = fixture();
    f.chain.set_head(35);
    f.chain.push_log(transfer_log(25, 0xb1, 10));
    f.chain.fail_logs_between(20, 29);

    let filter = f
        .scanner
        .add_watch_filter(TOKEN, None, FilterKind::Transfer, 0, Some(10))
        .unwrap();

    let summary = f.scanner.sync().await.unwrap();
    assert_eq!(summary.failed, vec![filter.id]);
    assert_eq!(summary.chunks, 1);
    assert_eq!(f.store.filter(filter.id).unwrap().max_block, Some(19));
    assert!(f
        .store
        .synchronized_blocks(filter.id)
        .iter()
        .any(|range| range.status == BlockRangeStatus::Pending));

    // The next run resumes where the failed chunk began.
    f.chain.clear_log_failures();
    let summary = f.scanner.sync().await.unwrap();
    assert!(summary.failed.is_empty());
    assert_eq!(summary.delivered, 1);
    assert_eq!(f.store.filter(filter.id).unwrap().max_block, Some(35));
}

#[tokio::test]
async fn test_undelivered_transfer_is_retried() {
    let f = fixture();
    f.chain.set_head(15);
    f.chain.push_log(transfer_log(12, 0xc1, 10));
    let filter = f
        .scanner
        .add_watch_filter(TOKEN, None, FilterKind::Transfer, 0, Some(10))
        .unwrap();

    f.publisher.set_failing(true);
    let summary = f.scanner.sync().await.unwrap();
    assert_eq!(summary.failed, vec![filter.id]);
    assert_eq!(f.store.filter(filter.id).unwrap().max_block, None);

    f.publisher.set_failing(false);
    let summary = f.scanner.sync().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(f.publisher.callbacks().len(), 1);
    assert_eq!(f.store.filter(filter.id).unwrap().max_block, Some(15));
}

#[tokio::test]
async fn test_equivalent_filter_is_reused() {
    let f = fixture();
    let params = Some(json!({"to": Address::repeat_byte(0x02).to_string()}));

    let first = f
        .scanner
        .add_watch_filter(TOKEN, params.clone(), FilterKind::Transfer, 18, None)
        .unwrap();
    let second = f
        .scanner
        .add_watch_filter(TOKEN, params, FilterKind::Transfer, 18, None)
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(f.store.filters().len(), 1);

    assert!(f
        .scanner
        .add_watch_filter(TOKEN, Some(json!({"to": 5})), FilterKind::Transfer, 18, None)
        .is_err());
}

#[tokio::test]
async fn test_filter_without_start_block_begins_at_head() {
    let f = fixture();
    f.chain.set_head(500);
    f.chain.push_log(transfer_log(100, 0xd1, 10));
    let filter = f
        .scanner
        .add_watch_filter(TOKEN, None, FilterKind::Transfer, 0, None)
        .unwrap();

    let summary = f.scanner.sync().await.unwrap();
    assert_eq!(summary.transfers, 0);
    assert_eq!(f.store.filter(filter.id).unwrap().max_block, Some(500));
}
