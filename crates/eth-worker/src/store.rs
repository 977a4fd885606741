//! The task store.
//!
//! Holds every persistent table of the worker (wallets, tasks with their
//! dependency edges, transaction attempts, sync filters, synchronized block
//! ranges, reversal claims) behind one mutex, together with the graph and
//! nonce queries the other components need. The lock is never held across an
//! await point.
//!
//! The whole store can be written to and restored from a JSON snapshot.

use crate::error::{WorkerError, WorkerResult};
use crate::types::{
    derive_task_status, now_millis, BlockRangeStatus, FilterId, FilterKind, NewTask,
    SyncFilter, SynchronizedBlock, Task, TaskId, TaskStatus, ThirdPartyTransfer, Timestamp,
    Transaction, TransactionId, TransactionStatus, Wallet, WalletId,
};
use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

/// Error text recorded on rows swept for exceeding the pending expiry.
pub const TIMEOUT_ERROR: &str = "Timeout Error";

/// Result of a nonce claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceClaim {
    pub nonce: u64,
    /// Pending rows swept to FAILED before the claim.
    pub expired: Vec<TransactionId>,
    /// Failed rows whose nonce was released before the claim.
    pub unconsumed: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_wallet_id: WalletId,
    next_task_id: TaskId,
    next_transaction_id: TransactionId,
    next_filter_id: FilterId,
    wallets: BTreeMap<WalletId, Wallet>,
    tasks: BTreeMap<TaskId, Task>,
    transactions: BTreeMap<TransactionId, Transaction>,
    filters: BTreeMap<FilterId, SyncFilter>,
    synchronized_blocks: Vec<SynchronizedBlock>,
    /// Task id -> claim expiry.
    reversal_claims: BTreeMap<TaskId, Timestamp>,
    #[serde(skip)]
    indexes: Indexes,
}

#[derive(Debug, Default)]
struct Indexes {
    wallet_by_address: HashMap<Address, WalletId>,
    task_by_uuid: HashMap<Uuid, TaskId>,
    attempts: HashMap<TaskId, Vec<TransactionId>>,
    third_party: HashMap<(B256, u64), TransactionId>,
}

impl Tables {
    fn rebuild_indexes(&mut self) {
        let mut indexes = Indexes::default();
        for wallet in self.wallets.values() {
            indexes.wallet_by_address.insert(wallet.address, wallet.id);
        }
        for task in self.tasks.values() {
            indexes.task_by_uuid.insert(task.uuid, task.id);
        }
        for txn in self.transactions.values() {
            if let Some(task_id) = txn.task_id {
                indexes.attempts.entry(task_id).or_default().push(txn.id);
            }
            if let (Some(hash), Some(tp)) = (txn.hash, &txn.third_party) {
                indexes.third_party.insert((hash, tp.log_index), txn.id);
            }
        }
        self.indexes = indexes;
    }

    fn task(&self, id: TaskId) -> WorkerResult<&Task> {
        self.tasks
            .get(&id)
            .ok_or_else(|| WorkerError::TaskNotFound(id.to_string()))
    }

    fn attempts(&self, task_id: TaskId) -> impl Iterator<Item = &Transaction> {
        self.indexes
            .attempts
            .get(&task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.transactions.get(id))
    }

    fn status(&self, task_id: TaskId) -> TaskStatus {
        derive_task_status(self.attempts(task_id).map(|t| t.status))
    }

    fn touch(txn: &mut Transaction, now: Timestamp) {
        txn.updated_at = now.max(txn.updated_at.saturating_add(1));
    }

    fn wallet_transactions(&self, wallet_id: WalletId) -> impl Iterator<Item = &Transaction> {
        self.transactions
            .values()
            .filter(move |t| t.signing_wallet_id == Some(wallet_id))
    }

    fn fail_expired_transactions(
        &mut self,
        exclude: TransactionId,
        now: Timestamp,
        expiry_ms: u64,
    ) -> Vec<TransactionId> {
        let cutoff = now.saturating_sub(expiry_ms);
        let mut expired = Vec::new();
        for txn in self.transactions.values_mut() {
            if txn.id != exclude
                && txn.status == TransactionStatus::Pending
                && !txn.is_third_party()
                && txn.created_at < cutoff
            {
                txn.status = TransactionStatus::Failed;
                txn.error = Some(TIMEOUT_ERROR.to_string());
                Self::touch(txn, now);
                expired.push(txn.id);
            }
        }
        expired
    }

    fn unconsume_high_failed_nonces(
        &mut self,
        wallet_id: WalletId,
        now: Timestamp,
        expiry_ms: u64,
    ) -> usize {
        let cutoff = now.saturating_sub(expiry_ms);
        let highest_success = self
            .wallet_transactions(wallet_id)
            .filter(|t| t.status == TransactionStatus::Success)
            .filter_map(|t| t.nonce)
            .max();

        let mut released = 0;
        for txn in self.transactions.values_mut() {
            let above_success = match (txn.nonce, highest_success) {
                (Some(nonce), Some(highest)) => nonce > highest,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if txn.signing_wallet_id == Some(wallet_id)
                && txn.status == TransactionStatus::Failed
                && txn.nonce_consumed
                && above_success
                && txn.created_at < cutoff
            {
                txn.nonce_consumed = false;
                Self::touch(txn, now);
                released += 1;
            }
        }
        released
    }

    fn next_nonce(&self, wallet_id: WalletId, exclude: TransactionId, network_nonce: u64) -> u64 {
        let used: BTreeSet<u64> = self
            .wallet_transactions(wallet_id)
            .filter(|t| t.id != exclude && t.holds_nonce())
            .filter_map(|t| t.nonce)
            .collect();
        let mut candidate = network_nonce;
        while used.contains(&candidate) {
            candidate += 1;
        }
        candidate
    }
}

/// In-memory store shared by every component.
#[derive(Debug, Default)]
pub struct Store {
    tables: Mutex<Tables>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Restores a store from `path`, or returns an empty store if the file
    /// does not exist yet.
    pub fn load_snapshot(path: &Path) -> WorkerResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let mut tables: Tables = serde_json::from_slice(&bytes)?;
        tables.rebuild_indexes();
        info!(
            path = %path.display(),
            tasks = tables.tasks.len(),
            transactions = tables.transactions.len(),
            "Loaded snapshot"
        );
        Ok(Self {
            tables: Mutex::new(tables),
        })
    }

    /// Writes the store to `path` atomically (write then rename).
    pub fn save_snapshot(&self, path: &Path) -> WorkerResult<()> {
        let bytes = {
            let tables = self.tables();
            serde_json::to_vec_pretty(&*tables)?
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Saved snapshot");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------

    /// Inserts the wallet built by `build` under a fresh id, unless `address`
    /// is already known. An existing wallet is returned when
    /// `allow_existing` is set and rejected otherwise.
    pub fn insert_wallet<F>(&self, address: Address, allow_existing: bool, build: F) -> WorkerResult<Wallet>
    where
        F: FnOnce(WalletId) -> WorkerResult<Wallet>,
    {
        let mut tables = self.tables();
        if let Some(id) = tables.indexes.wallet_by_address.get(&address) {
            if !allow_existing {
                return Err(WorkerError::WalletExists(address.to_string()));
            }
            return tables
                .wallets
                .get(id)
                .cloned()
                .ok_or_else(|| WorkerError::Internal(format!("wallet index out of sync for {address}")));
        }

        let id = tables.next_wallet_id + 1;
        let wallet = build(id)?;
        if wallet.address != address {
            return Err(WorkerError::Internal(
                "wallet address does not match its key".to_string(),
            ));
        }
        tables.next_wallet_id = id;
        tables.indexes.wallet_by_address.insert(address, id);
        tables.wallets.insert(id, wallet.clone());
        Ok(wallet)
    }

    pub fn wallet(&self, id: WalletId) -> WorkerResult<Wallet> {
        self.tables()
            .wallets
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkerError::WalletNotFound(format!("id {id}")))
    }

    pub fn wallet_by_address(&self, address: &Address) -> Option<Wallet> {
        let tables = self.tables();
        tables
            .indexes
            .wallet_by_address
            .get(address)
            .and_then(|id| tables.wallets.get(id))
            .cloned()
    }

    pub fn wallet_by_encrypted_key(&self, encrypted_private_key: &str) -> Option<Wallet> {
        self.tables()
            .wallets
            .values()
            .find(|w| w.encrypted_private_key == encrypted_private_key)
            .cloned()
    }

    pub fn update_wallet<F>(&self, id: WalletId, f: F) -> WorkerResult<Wallet>
    where
        F: FnOnce(&mut Wallet),
    {
        let mut tables = self.tables();
        let wallet = tables
            .wallets
            .get_mut(&id)
            .ok_or_else(|| WorkerError::WalletNotFound(format!("id {id}")))?;
        f(wallet);
        Ok(wallet.clone())
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        self.tables().wallets.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Inserts a task. Returns the existing task and `false` if the uuid is
    /// already known.
    pub fn insert_task(&self, new: NewTask) -> (Task, bool) {
        let mut tables = self.tables();
        if let Some(task) = tables
            .indexes
            .task_by_uuid
            .get(&new.uuid)
            .and_then(|id| tables.tasks.get(id))
        {
            return (task.clone(), false);
        }

        tables.next_task_id += 1;
        let task = Task {
            id: tables.next_task_id,
            uuid: new.uuid,
            kind: new.kind,
            signing_wallet_id: new.signing_wallet_id,
            status_text: None,
            previous_invocations: 0,
            reverses: new.reverses,
            prior_tasks: BTreeSet::new(),
            posterior_tasks: BTreeSet::new(),
            created_at: now_millis(),
        };
        tables.indexes.task_by_uuid.insert(task.uuid, task.id);
        tables.tasks.insert(task.id, task.clone());
        (task, true)
    }

    pub fn task(&self, id: TaskId) -> WorkerResult<Task> {
        self.tables().task(id).cloned()
    }

    pub fn task_by_uuid(&self, uuid: &Uuid) -> WorkerResult<Task> {
        let tables = self.tables();
        tables
            .indexes
            .task_by_uuid
            .get(uuid)
            .and_then(|id| tables.tasks.get(id))
            .cloned()
            .ok_or_else(|| WorkerError::TaskNotFound(uuid.to_string()))
    }

    pub fn update_task<F>(&self, id: TaskId, f: F) -> WorkerResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut tables = self.tables();
        let task = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| WorkerError::TaskNotFound(id.to_string()))?;
        f(task);
        Ok(task.clone())
    }

    /// Records `prior -> posterior` on both tasks.
    pub fn add_dependency(&self, prior: TaskId, posterior: TaskId) -> WorkerResult<()> {
        if prior == posterior {
            return Err(WorkerError::Internal(format!(
                "task {prior} cannot depend on itself"
            )));
        }
        let mut tables = self.tables();
        tables.task(prior)?;
        tables.task(posterior)?;
        if let Some(task) = tables.tasks.get_mut(&prior) {
            task.posterior_tasks.insert(posterior);
        }
        if let Some(task) = tables.tasks.get_mut(&posterior) {
            task.prior_tasks.insert(prior);
        }
        Ok(())
    }

    /// Derived status of a task.
    pub fn task_status(&self, id: TaskId) -> WorkerResult<TaskStatus> {
        let tables = self.tables();
        tables.task(id)?;
        Ok(tables.status(id))
    }

    /// Attempts of a task, oldest first.
    pub fn task_attempts(&self, id: TaskId) -> Vec<Transaction> {
        self.tables().attempts(id).cloned().collect()
    }

    /// Prior tasks that have not succeeded.
    pub fn unsatisfied_prior_tasks(&self, id: TaskId) -> WorkerResult<Vec<Task>> {
        let tables = self.tables();
        let task = tables.task(id)?;
        Ok(task
            .prior_tasks
            .iter()
            .filter(|prior| tables.status(**prior) != TaskStatus::Success)
            .filter_map(|prior| tables.tasks.get(prior).cloned())
            .collect())
    }

    /// Posterior tasks without any attempt.
    pub fn unstarted_posterior_tasks(&self, id: TaskId) -> WorkerResult<Vec<Task>> {
        let tables = self.tables();
        let task = tables.task(id)?;
        Ok(task
            .posterior_tasks
            .iter()
            .filter(|posterior| tables.status(**posterior) == TaskStatus::Unstarted)
            .filter_map(|posterior| tables.tasks.get(posterior).cloned())
            .collect())
    }

    /// Tasks in `[min, max]` whose derived status is one of `statuses`.
    pub fn tasks_in_range(
        &self,
        min: Option<TaskId>,
        max: Option<TaskId>,
        statuses: &[TaskStatus],
    ) -> Vec<Task> {
        let tables = self.tables();
        let min = min.unwrap_or(0);
        let max = max.unwrap_or(TaskId::MAX);
        if min > max {
            return Vec::new();
        }
        tables
            .tasks
            .range(min..=max)
            .filter(|(id, _)| statuses.contains(&tables.status(**id)))
            .map(|(_, task)| task.clone())
            .collect()
    }

    /// Tasks created to reverse `id`.
    pub fn reversal_tasks(&self, id: TaskId) -> Vec<Task> {
        self.tables()
            .tasks
            .values()
            .filter(|t| t.reverses == Some(id))
            .cloned()
            .collect()
    }

    /// Tasks in `[min, max]` with more than one SUCCESS attempt, paired with
    /// their success count.
    pub fn duplicate_success_tasks(
        &self,
        min: Option<TaskId>,
        max: Option<TaskId>,
    ) -> Vec<(Task, usize)> {
        let tables = self.tables();
        let min = min.unwrap_or(0);
        let max = max.unwrap_or(TaskId::MAX);
        if min > max {
            return Vec::new();
        }
        tables
            .tasks
            .range(min..=max)
            .filter_map(|(id, task)| {
                let successes = tables
                    .attempts(*id)
                    .filter(|t| t.status == TransactionStatus::Success)
                    .count();
                (successes > 1).then(|| (task.clone(), successes))
            })
            .collect()
    }

    /// Takes the cross-process reversal claim for a task. Fails while an
    /// unexpired claim exists.
    pub fn try_claim_reversal(&self, task_id: TaskId, now: Timestamp, ttl_ms: u64) -> bool {
        let mut tables = self.tables();
        match tables.reversal_claims.get(&task_id) {
            Some(expires_at) if *expires_at > now => false,
            _ => {
                tables
                    .reversal_claims
                    .insert(task_id, now.saturating_add(ttl_ms));
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Creates a PENDING attempt without a nonce for `task_id`.
    pub fn create_attempt(&self, task_id: TaskId) -> WorkerResult<Transaction> {
        let mut tables = self.tables();
        let wallet_id = tables.task(task_id)?.signing_wallet_id;
        tables.next_transaction_id += 1;
        let txn = Transaction::attempt(tables.next_transaction_id, task_id, wallet_id, now_millis());
        tables.indexes.attempts.entry(task_id).or_default().push(txn.id);
        tables.transactions.insert(txn.id, txn.clone());
        Ok(txn)
    }

    pub fn transaction(&self, id: TransactionId) -> WorkerResult<Transaction> {
        self.tables()
            .transactions
            .get(&id)
            .cloned()
            .ok_or(WorkerError::TransactionNotFound(id))
    }

    /// Applies `f` to a transaction row and bumps its update timestamp.
    pub fn update_transaction<F>(&self, id: TransactionId, f: F) -> WorkerResult<Transaction>
    where
        F: FnOnce(&mut Transaction),
    {
        let mut tables = self.tables();
        let txn = tables
            .transactions
            .get_mut(&id)
            .ok_or(WorkerError::TransactionNotFound(id))?;
        f(txn);
        Tables::touch(txn, now_millis());
        Ok(txn.clone())
    }

    /// Excludes a transaction from nonce bookkeeping.
    pub fn ignore_transaction(&self, id: TransactionId) -> WorkerResult<Transaction> {
        self.update_transaction(id, |txn| txn.ignore = true)
    }

    /// Attempts still awaiting confirmation.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.tables()
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Pending && !t.is_third_party())
            .cloned()
            .collect()
    }

    /// Runs the expiry sweeps and reserves the lowest free nonce at or above
    /// `network_nonce` for `txn_id`.
    ///
    /// The caller must hold the wallet's nonce lock.
    pub fn claim_nonce(
        &self,
        wallet_id: WalletId,
        txn_id: TransactionId,
        network_nonce: u64,
        now: Timestamp,
        expiry_ms: u64,
    ) -> WorkerResult<NonceClaim> {
        let mut tables = self.tables();
        if !tables.transactions.contains_key(&txn_id) {
            return Err(WorkerError::TransactionNotFound(txn_id));
        }

        let expired = tables.fail_expired_transactions(txn_id, now, expiry_ms);
        let unconsumed = tables.unconsume_high_failed_nonces(wallet_id, now, expiry_ms);
        let nonce = tables.next_nonce(wallet_id, txn_id, network_nonce);

        let txn = tables
            .transactions
            .get_mut(&txn_id)
            .ok_or(WorkerError::TransactionNotFound(txn_id))?;
        txn.nonce = Some(nonce);
        txn.status = TransactionStatus::Pending;
        txn.signing_wallet_id = Some(wallet_id);
        Tables::touch(txn, now);

        Ok(NonceClaim {
            nonce,
            expired,
            unconsumed,
        })
    }

    // ------------------------------------------------------------------
    // Third-party records
    // ------------------------------------------------------------------

    /// Returns the record for `(hash, log_index)`, creating it if needed.
    pub fn record_third_party(
        &self,
        hash: B256,
        block_number: u64,
        transfer: ThirdPartyTransfer,
    ) -> Transaction {
        let mut tables = self.tables();
        let key = (hash, transfer.log_index);
        if let Some(existing) = tables
            .indexes
            .third_party
            .get(&key)
            .and_then(|id| tables.transactions.get(id))
        {
            return existing.clone();
        }

        let now = now_millis();
        tables.next_transaction_id += 1;
        let txn = Transaction {
            id: tables.next_transaction_id,
            task_id: None,
            status: TransactionStatus::Success,
            hash: Some(hash),
            nonce: None,
            signing_wallet_id: None,
            created_at: now,
            submitted_at: None,
            mined_at: Some(now),
            block_number: Some(block_number),
            contract_address: None,
            error: None,
            message: None,
            nonce_consumed: false,
            ignore: true,
            updated_at: now,
            third_party: Some(transfer),
        };
        tables.indexes.third_party.insert(key, txn.id);
        tables.transactions.insert(txn.id, txn.clone());
        txn
    }

    /// Marks a third-party record as delivered to the application.
    pub fn mark_webhook_delivered(&self, id: TransactionId) -> WorkerResult<()> {
        let mut tables = self.tables();
        let tp = tables
            .transactions
            .get_mut(&id)
            .and_then(|t| t.third_party.as_mut())
            .ok_or(WorkerError::TransactionNotFound(id))?;
        tp.webhook_delivered = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync filters
    // ------------------------------------------------------------------

    /// Adds a filter unless an equivalent one exists. Returns the filter and
    /// whether it was created.
    pub fn add_filter(
        &self,
        contract_address: Address,
        filter_parameters: Option<Value>,
        kind: FilterKind,
        decimals: u8,
        start_block: Option<u64>,
    ) -> (SyncFilter, bool) {
        let mut tables = self.tables();
        if let Some(existing) = tables
            .filters
            .values()
            .find(|f| f.is_equivalent(&contract_address, &filter_parameters, kind))
        {
            return (existing.clone(), false);
        }

        tables.next_filter_id += 1;
        let filter = SyncFilter {
            id: tables.next_filter_id,
            contract_address,
            filter_parameters,
            kind,
            decimals,
            start_block,
            max_block: None,
            created_at: now_millis(),
        };
        tables.filters.insert(filter.id, filter.clone());
        (filter, true)
    }

    pub fn filters(&self) -> Vec<SyncFilter> {
        self.tables().filters.values().cloned().collect()
    }

    pub fn filter(&self, id: FilterId) -> Option<SyncFilter> {
        self.tables().filters.get(&id).cloned()
    }

    /// Moves a filter's `max_block` forward. Never moves it back.
    pub fn advance_filter(&self, id: FilterId, to_block: u64) {
        if let Some(filter) = self.tables().filters.get_mut(&id) {
            filter.max_block = Some(filter.max_block.map_or(to_block, |b| b.max(to_block)));
        }
    }

    /// Records an attempt at scanning a block chunk.
    pub fn record_block_range(
        &self,
        filter_id: FilterId,
        from_block: u64,
        to_block: u64,
        status: BlockRangeStatus,
    ) -> SynchronizedBlock {
        let mut tables = self.tables();
        let now = now_millis();
        if let Some(range) = tables.synchronized_blocks.iter_mut().find(|r| {
            r.filter_id == filter_id && r.from_block == from_block && r.to_block == to_block
        }) {
            range.status = status;
            range.attempts += 1;
            range.updated_at = now;
            return range.clone();
        }
        let range = SynchronizedBlock {
            filter_id,
            from_block,
            to_block,
            status,
            attempts: 1,
            updated_at: now,
        };
        tables.synchronized_blocks.push(range.clone());
        range
    }

    pub fn synchronized_blocks(&self, filter_id: FilterId) -> Vec<SynchronizedBlock> {
        self.tables()
            .synchronized_blocks
            .iter()
            .filter(|r| r.filter_id == filter_id)
            .cloned()
            .collect()
    }
}
