//! Third-party transfer scanner.
//!
//! Watches token contracts for `Transfer` logs this worker did not send and
//! mirrors them to the application webhook. Delivery is at least once: a
//! block chunk only counts as synchronised after every transfer in it was
//! delivered, so the next run picks up where a failed delivery stopped.

use crate::chain::{transfer_topic, ChainClient, LogEntry, LogQuery};
use crate::error::{WorkerError, WorkerResult};
use crate::lock::Locks;
use crate::store::Store;
use crate::types::{BlockRangeStatus, FilterId, FilterKind, SyncFilter, ThirdPartyTransfer};
use crate::webhook::{Publisher, TransactionCallback};
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scan sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Blocks per `eth_getLogs` request.
    pub chunk_size: u64,
    /// Chunks scanned per filter per run.
    pub max_chunks_per_run: usize,
    /// Seconds between scheduled runs. Zero disables scheduling.
    pub interval_secs: u64,
    pub lock_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            chunk_size: 2_000,
            max_chunks_per_run: 10,
            interval_secs: 30,
            lock_ttl_secs: 300,
        }
    }
}

/// What one [`ThirdPartySyncScanner::sync`] run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub filters: usize,
    /// Filters skipped because another run holds their lock.
    pub locked: usize,
    pub chunks: usize,
    pub transfers: usize,
    pub delivered: usize,
    /// Filters that stopped early this run.
    pub failed: Vec<FilterId>,
}

/// Mirrors transfer logs of watched contracts to the application.
#[derive(Clone)]
pub struct ThirdPartySyncScanner {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    publisher: Arc<dyn Publisher>,
    locks: Locks,
    settings: SyncSettings,
}

impl ThirdPartySyncScanner {
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        publisher: Arc<dyn Publisher>,
        locks: Locks,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            chain,
            publisher,
            locks,
            settings,
        }
    }

    /// Starts watching a contract. Adding an equivalent filter again returns
    /// the existing one.
    pub fn add_watch_filter(
        &self,
        contract_address: Address,
        filter_parameters: Option<Value>,
        kind: FilterKind,
        decimals: u8,
        start_block: Option<u64>,
    ) -> WorkerResult<SyncFilter> {
        parse_filter_parameters(&filter_parameters)?;
        let (filter, created) =
            self.store
                .add_filter(contract_address, filter_parameters, kind, decimals, start_block);
        if created {
            info!(
                filter_id = filter.id,
                contract = %contract_address,
                start_block = ?start_block,
                "Watching contract"
            );
        } else {
            debug!(filter_id = filter.id, "Equivalent filter already exists");
        }
        Ok(filter)
    }

    /// Scans every filter up to the current head.
    pub async fn sync(&self) -> WorkerResult<SyncSummary> {
        let mut summary = SyncSummary::default();
        let filters = self.store.filters();
        if filters.is_empty() {
            return Ok(summary);
        }
        let head = self.chain.block_number().await?;
        let lock_ttl = Duration::from_secs(self.settings.lock_ttl_secs);

        for filter in filters {
            summary.filters += 1;
            let key = format!("SyncFilter-{}", filter.id);
            let Some(_guard) = self.locks.try_acquire(&key, lock_ttl) else {
                debug!(filter_id = filter.id, "Filter is being synchronised elsewhere");
                summary.locked += 1;
                continue;
            };
            if let Err(err) = self.sync_filter(filter.id, head, &mut summary).await {
                warn!(
                    filter_id = filter.id,
                    error = %err.sanitized_message(),
                    "Stopped synchronising filter"
                );
                summary.failed.push(filter.id);
            }
        }

        if summary.transfers > 0 {
            info!(
                head,
                transfers = summary.transfers,
                delivered = summary.delivered,
                "Synchronised third-party transfers"
            );
        }
        Ok(summary)
    }

    async fn sync_filter(
        &self,
        filter_id: FilterId,
        head: u64,
        summary: &mut SyncSummary,
    ) -> WorkerResult<()> {
        // Re-read under the lock; another run may have advanced it.
        let filter = self
            .store
            .filter(filter_id)
            .ok_or_else(|| WorkerError::Internal(format!("filter {filter_id} vanished")))?;
        let start = match filter.max_block {
            Some(block) => block.saturating_add(1),
            None => filter.start_block.unwrap_or(head),
        };
        if start > head {
            return Ok(());
        }
        let (senders, recipients) = parse_filter_parameters(&filter.filter_parameters)?;

        for (from_block, to_block) in chunk_ranges(
            start,
            head,
            self.settings.chunk_size,
            self.settings.max_chunks_per_run,
        ) {
            let query = LogQuery {
                address: filter.contract_address,
                from_block,
                to_block,
                senders: senders.clone(),
                recipients: recipients.clone(),
            };
            let delivered = match self.chain.transfer_logs(&query).await {
                Ok(logs) => self.deliver_chunk(&filter, logs, summary).await,
                Err(err) => Err(err),
            };
            if let Err(err) = delivered {
                self.store
                    .record_block_range(filter.id, from_block, to_block, BlockRangeStatus::Pending);
                return Err(err);
            }

            self.store
                .record_block_range(filter.id, from_block, to_block, BlockRangeStatus::Success);
            self.store.advance_filter(filter.id, to_block);
            summary.chunks += 1;
            debug!(filter_id = filter.id, from_block, to_block, "Chunk synchronised");
        }
        Ok(())
    }

    async fn deliver_chunk(
        &self,
        filter: &SyncFilter,
        logs: Vec<LogEntry>,
        summary: &mut SyncSummary,
    ) -> WorkerResult<()> {
        for log in logs {
            let Some(transfer) = decode_transfer(&log, filter) else {
                warn!(
                    filter_id = filter.id,
                    hash = %log.transaction_hash,
                    log_index = log.log_index,
                    "Skipping malformed transfer log"
                );
                continue;
            };
            summary.transfers += 1;

            let txn = self
                .store
                .record_third_party(log.transaction_hash, log.block_number, transfer);
            if txn.third_party.as_ref().is_some_and(|t| t.webhook_delivered) {
                continue;
            }
            self.publisher
                .publish(&TransactionCallback::from_transaction(&txn, None))
                .await?;
            self.store.mark_webhook_delivered(txn.id)?;
            summary.delivered += 1;
        }
        Ok(())
    }
}

/// Splits `[start, end]` into inclusive chunks of `size` blocks, at most
/// `max_chunks` of them.
pub(crate) fn chunk_ranges(start: u64, end: u64, size: u64, max_chunks: usize) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut ranges = Vec::new();
    let mut from = start;
    while from <= end && ranges.len() < max_chunks {
        let to = from.saturating_add(size - 1).min(end);
        ranges.push((from, to));
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    ranges
}

/// Reads the `from`/`to` address lists of a filter. Each may be a single
/// address or an array.
fn parse_filter_parameters(params: &Option<Value>) -> WorkerResult<(Vec<Address>, Vec<Address>)> {
    let Some(params) = params.as_ref().filter(|p| !p.is_null()) else {
        return Ok((Vec::new(), Vec::new()));
    };
    let object = params.as_object().ok_or_else(|| {
        WorkerError::InvalidAddress("filter parameters must be an object".to_string())
    })?;
    Ok((
        addresses(object.get("from"))?,
        addresses(object.get("to"))?,
    ))
}

fn addresses(value: Option<&Value>) -> WorkerResult<Vec<Address>> {
    let parse = |v: &Value| {
        v.as_str()
            .and_then(|s| Address::from_str(s).ok())
            .ok_or_else(|| WorkerError::InvalidAddress(v.to_string()))
    };
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse).collect(),
        Some(single) => Ok(vec![parse(single)?]),
    }
}

fn decode_transfer(log: &LogEntry, filter: &SyncFilter) -> Option<ThirdPartyTransfer> {
    if log.topics.len() < 3 || log.topics[0] != transfer_topic() || log.data.len() < 32 {
        return None;
    }
    Some(ThirdPartyTransfer {
        filter_id: filter.id,
        sender: Address::from_word(log.topics[1]),
        recipient: Address::from_word(log.topics[2]),
        amount: U256::from_be_slice(&log.data[..32]),
        decimals: filter.decimals,
        contract_address: log.address,
        log_index: log.log_index,
        webhook_delivered: false,
    })
}
