#![allow(dead_code)]

use alloy::consensus::{Transaction as _, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::json_abi::JsonAbi;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use eth_worker::chain::abi::ContractRegistry;
use eth_worker::chain::{CallRequest, ChainClient, LogEntry, LogQuery, ReceiptSummary};
use eth_worker::crypto::KeyCipher;
use eth_worker::error::{WorkerError, WorkerResult};
use eth_worker::lock::Locks;
use eth_worker::scheduler::{Job, Scheduler};
use eth_worker::store::Store;
use eth_worker::supervisor::{SupervisorSettings, TaskSupervisor};
use eth_worker::types::{TopupPolicy, Wallet};
use eth_worker::wallet::WalletStore;
use eth_worker::webhook::{Publisher, TransactionCallback};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const CHAIN_ID: u64 = 1337;
pub const MINED_BLOCK: u64 = 42;
/// Address reported in receipts of deployments.
pub const DEPLOYED_CONTRACT: Address = Address::repeat_byte(0xdc);

#[derive(Debug, Default)]
struct ChainState {
    transaction_counts: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    receipts: HashMap<B256, ReceiptSummary>,
    sent: Vec<Bytes>,
    failing_sends: VecDeque<WorkerError>,
    lost_send_responses: usize,
    failing_receipts: usize,
    unmined: Vec<(B256, bool)>,
    balance_delay: Duration,
    revert_all: bool,
    auto_mine: bool,
    head: u64,
    logs: Vec<LogEntry>,
    failing_log_ranges: Vec<(u64, u64)>,
    call_output: Bytes,
}

/// Scripted chain. Broadcast transactions are mined at [`MINED_BLOCK`]
/// unless auto mining is switched off.
#[derive(Debug)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            state: Mutex::new(ChainState {
                auto_mine: true,
                head: MINED_BLOCK,
                ..Default::default()
            }),
        }
    }
}

impl MockChain {
    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.state().transaction_counts.insert(address, count);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    /// The next `count` broadcasts are rejected by the node.
    pub fn fail_next_sends(&self, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state
                .failing_sends
                .push_back(WorkerError::pre_blockchain("nonce too low"));
        }
    }

    /// The next broadcast reaches the node, but the response is lost and
    /// the caller sees a transport error.
    pub fn drop_next_send(&self) {
        self.state().lost_send_responses += 1;
    }

    /// The next `count` receipt lookups fail at the transport level.
    pub fn fail_next_receipts(&self, count: usize) {
        self.state().failing_receipts += count;
    }

    /// Mines everything broadcast while auto mining was off.
    pub fn mine_pending(&self) {
        let mut state = self.state();
        let revert = state.revert_all;
        for (hash, deployment) in std::mem::take(&mut state.unmined) {
            state.receipts.insert(hash, receipt(!revert, deployment));
        }
    }

    /// Balance lookups answer after `delay`.
    pub fn set_balance_delay(&self, delay: Duration) {
        self.state().balance_delay = delay;
    }

    pub fn set_revert_all(&self, revert: bool) {
        self.state().revert_all = revert;
    }

    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state().auto_mine = auto_mine;
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    pub fn push_log(&self, log: LogEntry) {
        self.state().logs.push(log);
    }

    pub fn fail_logs_between(&self, from_block: u64, to_block: u64) {
        self.state().failing_log_ranges.push((from_block, to_block));
    }

    pub fn clear_log_failures(&self) {
        self.state().failing_log_ranges.clear();
    }

    pub fn set_call_output(&self, output: Bytes) {
        self.state().call_output = output;
    }

    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> WorkerResult<u64> {
        Ok(CHAIN_ID)
    }

    async fn transaction_count(&self, address: Address) -> WorkerResult<u64> {
        Ok(self
            .state()
            .transaction_counts
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn balance(&self, address: Address) -> WorkerResult<U256> {
        let delay = self.state().balance_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn gas_price(&self) -> WorkerResult<u128> {
        Ok(1_000_000_000)
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> WorkerResult<u64> {
        Ok(21_000)
    }

    async fn call(&self, _request: &CallRequest) -> WorkerResult<Bytes> {
        Ok(self.state().call_output.clone())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> WorkerResult<B256> {
        let mut state = self.state();
        if let Some(err) = state.failing_sends.pop_front() {
            return Err(err);
        }
        // Legacy transactions hash to the keccak of their encoding.
        let hash = keccak256(&raw);
        let deployment = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|e| WorkerError::pre_blockchain(e.to_string()))?
            .to()
            .is_none();
        if state.auto_mine {
            let success = !state.revert_all;
            state.receipts.insert(hash, receipt(success, deployment));
        } else {
            state.unmined.push((hash, deployment));
        }
        state.sent.push(raw);
        if state.lost_send_responses > 0 {
            state.lost_send_responses -= 1;
            return Err(WorkerError::Rpc("connection reset".to_string()));
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: B256) -> WorkerResult<Option<ReceiptSummary>> {
        let mut state = self.state();
        if state.failing_receipts > 0 {
            state.failing_receipts -= 1;
            return Err(WorkerError::Rpc("receipt lookup timed out".to_string()));
        }
        Ok(state.receipts.get(&hash).copied())
    }

    async fn block_number(&self) -> WorkerResult<u64> {
        Ok(self.state().head)
    }

    async fn transfer_logs(&self, query: &LogQuery) -> WorkerResult<Vec<LogEntry>> {
        let state = self.state();
        if state
            .failing_log_ranges
            .iter()
            .any(|(from, to)| *from <= query.to_block && query.from_block <= *to)
        {
            return Err(WorkerError::Rpc("log query timed out".to_string()));
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address == query.address
                    && (query.from_block..=query.to_block).contains(&log.block_number)
            })
            .cloned()
            .collect())
    }
}

fn receipt(success: bool, deployment: bool) -> ReceiptSummary {
    ReceiptSummary {
        success,
        block_number: Some(MINED_BLOCK),
        contract_address: (success && deployment).then_some(DEPLOYED_CONTRACT),
    }
}

/// Collects jobs instead of running them.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    jobs: Mutex<VecDeque<(Job, Duration)>>,
}

impl RecordingScheduler {
    pub fn pop(&self) -> Option<(Job, Duration)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn pending(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(job, _)| job.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, job: Job, delay: Duration) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((job, delay));
    }
}

/// Keeps every published callback. Can be told to reject deliveries.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    callbacks: Mutex<Vec<TransactionCallback>>,
    failing: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn callbacks(&self) -> Vec<TransactionCallback> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, callback: &TransactionCallback) -> WorkerResult<()> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(WorkerError::Webhook {
                status_code: 503,
                message: "unavailable".to_string(),
            });
        }
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback.clone());
        Ok(())
    }
}

/// Name of the deployable contract known to the harness registry.
pub const GREETER: &str = "Greeter";

fn registry() -> ContractRegistry {
    let mut registry = ContractRegistry::with_builtins().unwrap();
    registry.register(
        GREETER,
        JsonAbi::default(),
        Some(Bytes::from_static(&[0x60, 0x80, 0x60, 0x40])),
    );
    registry
}

/// A supervisor over a scripted chain whose jobs are run by hand.
pub struct Harness {
    pub store: Arc<Store>,
    pub chain: Arc<MockChain>,
    pub publisher: Arc<RecordingPublisher>,
    pub scheduler: Arc<RecordingScheduler>,
    pub wallets: WalletStore,
    pub supervisor: TaskSupervisor,
    pub master: Wallet,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SupervisorSettings {
            chain_id: CHAIN_ID,
            ..Default::default()
        })
    }

    pub fn with_settings(settings: SupervisorSettings) -> Self {
        let store = Arc::new(Store::new());
        let chain = Arc::new(MockChain::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let scheduler = Arc::new(RecordingScheduler::default());
        let cipher = KeyCipher::from_base64(&KeyCipher::generate_key()).unwrap();
        let wallets = WalletStore::new(store.clone(), Arc::new(cipher));
        let master = wallets
            .create_wallet(None, false, TopupPolicy::default())
            .unwrap();
        let supervisor = TaskSupervisor::new(
            store.clone(),
            wallets.clone(),
            chain.clone(),
            Arc::new(registry()),
            publisher.clone(),
            scheduler.clone(),
            Locks::default(),
            Some(master.clone()),
            settings,
        );
        Self {
            store,
            chain,
            publisher,
            scheduler,
            wallets,
            supervisor,
            master,
        }
    }

    pub fn wallet(&self) -> Wallet {
        self.wallets
            .create_wallet(None, false, TopupPolicy::default())
            .unwrap()
    }

    pub async fn run_job(&self, job: Job) -> WorkerResult<()> {
        match job {
            Job::AttemptTask { task_id } => self.supervisor.attempt_task(task_id).await.map(|_| ()),
            Job::SubmitTransaction { txn_id, retries } => {
                self.supervisor.submit_transaction(txn_id, retries).await
            }
            Job::CheckTransaction { txn_id, polls } => {
                self.supervisor.check_transaction(txn_id, polls).await
            }
            Job::TopupWallets => self.supervisor.topup_wallets().await.map(|_| ()),
            Job::SyncThirdParty => Ok(()),
        }
    }

    /// Runs queued jobs, ignoring their delays, until the queue is empty or
    /// `max_steps` jobs ran. Returns the errors jobs reported.
    pub async fn drain(&self, max_steps: usize) -> Vec<WorkerError> {
        let mut errors = Vec::new();
        for _ in 0..max_steps {
            let Some((job, _)) = self.scheduler.pop() else {
                break;
            };
            if let Err(err) = self.run_job(job).await {
                errors.push(err);
            }
        }
        errors
    }
}
