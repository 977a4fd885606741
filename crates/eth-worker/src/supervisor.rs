//! Task state machine.
//!
//! The [`TaskSupervisor`] decides when a task gets an on-chain attempt and
//! what happens after each attempt resolves. It never sleeps: follow-up work
//! (submission, receipt checks, retries, released posteriors) is handed to
//! the [`Scheduler`] with a computed countdown.
//!
//! ```text
//! attempt_task ─┬─ prior not SUCCESS ─────────────► skip
//!               ├─ wallet below top-up threshold ──► queue top-up, skip
//!               ├─ TaskID lock held / in flight ───► skip
//!               └─ new PENDING row ─► SubmitTransaction ─► CheckTransaction
//!                                          │                   │
//!                                          └── FAILED ─────────┴─► fail_or_retry
//! ```

use crate::api::TaskView;
use crate::chain::abi::ContractRegistry;
use crate::chain::ChainClient;
use crate::error::{WorkerError, WorkerResult};
use crate::lock::Locks;
use crate::nonce::{NonceAllocator, NonceSettings};
use crate::poller::ConfirmationPoller;
use crate::retry::{PollBackoff, TaskRetryPolicy};
use crate::scheduler::{Job, Scheduler};
use crate::store::Store;
use crate::submitter::{GasSettings, TransactionSubmitter};
use crate::types::{
    NewTask, Task, TaskId, TaskKind, TaskStatus, TransactionId, TransactionStatus, Wallet,
};
use crate::wallet::{WalletRef, WalletStore};
use crate::webhook::{publish_transaction, Publisher};
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lock serialising top-up decisions for one wallet.
pub fn topup_lock_key(wallet: &Wallet) -> String {
    format!("WalletTopup-{}", wallet.id)
}

/// Knobs of the supervisor and the components it drives.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub retry: TaskRetryPolicy,
    pub poll: PollBackoff,
    pub gas: GasSettings,
    pub nonce: NonceSettings,
    pub chain_id: u64,
    pub task_lock_ttl: Duration,
    pub task_lock_wait: Duration,
    pub dedup_lock_ttl: Duration,
    pub reversal_claim_ttl: Duration,
    /// Transient submission failures tolerated before the attempt fails.
    pub max_submit_retries: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            retry: TaskRetryPolicy::default(),
            poll: PollBackoff::default(),
            gas: GasSettings::default(),
            nonce: NonceSettings::default(),
            chain_id: 1,
            task_lock_ttl: Duration::from_secs(10),
            task_lock_wait: Duration::from_secs(1),
            dedup_lock_ttl: Duration::from_secs(60),
            reversal_claim_ttl: Duration::from_secs(600),
            max_submit_retries: 5,
        }
    }
}

/// A request to create a task.
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub uuid: Uuid,
    pub kind: TaskKind,
    pub signer: WalletRef,
    /// Tasks that must succeed before this one is attempted.
    pub prior_tasks: Vec<Uuid>,
    /// Tasks that wait for this one.
    pub posterior_tasks: Vec<Uuid>,
    pub reverses: Option<Uuid>,
}

/// What a call to [`TaskSupervisor::attempt_task`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    PriorTasksUnsatisfied { prior_tasks: Vec<Uuid> },
    TopupRequired { topup_task: Uuid },
    LockNotAcquired,
    AlreadyInProgress { status: TaskStatus },
    RetriesExhausted,
    Submitted { txn_id: TransactionId },
}

/// Counts returned by [`TaskSupervisor::retry_failed_tasks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub failed: usize,
    pub unstarted: usize,
}

/// Drives tasks through their attempts.
#[derive(Clone)]
pub struct TaskSupervisor {
    pub(crate) store: Arc<Store>,
    pub(crate) wallets: WalletStore,
    pub(crate) chain: Arc<dyn ChainClient>,
    pub(crate) submitter: TransactionSubmitter,
    pub(crate) poller: ConfirmationPoller,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) locks: Locks,
    pub(crate) master_wallet: Option<Wallet>,
    pub(crate) settings: SupervisorSettings,
}

impl TaskSupervisor {
    /// Wires the submitter, poller and nonce allocator around shared clients.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        wallets: WalletStore,
        chain: Arc<dyn ChainClient>,
        registry: Arc<ContractRegistry>,
        publisher: Arc<dyn Publisher>,
        scheduler: Arc<dyn Scheduler>,
        locks: Locks,
        master_wallet: Option<Wallet>,
        settings: SupervisorSettings,
    ) -> Self {
        let nonces = NonceAllocator::new(
            store.clone(),
            chain.clone(),
            locks.clone(),
            publisher.clone(),
            settings.nonce,
        );
        let submitter = TransactionSubmitter::new(
            store.clone(),
            wallets.clone(),
            chain.clone(),
            nonces,
            registry,
            publisher.clone(),
            settings.gas,
            settings.chain_id,
        );
        let poller = ConfirmationPoller::new(
            store.clone(),
            chain.clone(),
            publisher.clone(),
            settings.nonce.pending_expiry,
        );
        Self {
            store,
            wallets,
            chain,
            submitter,
            poller,
            publisher,
            scheduler,
            locks,
            master_wallet,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn wallets(&self) -> &WalletStore {
        &self.wallets
    }

    pub fn master_wallet(&self) -> Option<&Wallet> {
        self.master_wallet.as_ref()
    }

    /// Records a task and queues its first attempt.
    ///
    /// Creating a task whose uuid already exists returns the existing task
    /// unchanged.
    pub fn create_task(&self, request: CreateTask) -> WorkerResult<Task> {
        if let Ok(existing) = self.store.task_by_uuid(&request.uuid) {
            info!(task_uuid = %existing.uuid, "Task already exists");
            return Ok(existing);
        }

        let wallet = self.wallets.get_signing_wallet(&request.signer)?;
        let prior_ids = self.resolve_uuids(&request.prior_tasks)?;
        let posterior_ids = self.resolve_uuids(&request.posterior_tasks)?;
        let reverses = match request.reverses {
            Some(uuid) => Some(self.store.task_by_uuid(&uuid)?.id),
            None => None,
        };

        let (task, _) = self.store.insert_task(NewTask {
            uuid: request.uuid,
            kind: request.kind,
            signing_wallet_id: wallet.id,
            reverses,
        });
        for prior in prior_ids {
            self.store.add_dependency(prior, task.id)?;
        }
        for posterior in posterior_ids {
            self.store.add_dependency(task.id, posterior)?;
        }

        info!(
            task_uuid = %task.uuid,
            task_id = task.id,
            task_type = task.kind.type_name(),
            signer = %wallet.address,
            "Created task"
        );
        self.scheduler
            .schedule(Job::AttemptTask { task_id: task.id }, Duration::ZERO);
        self.store.task(task.id)
    }

    fn resolve_uuids(&self, uuids: &[Uuid]) -> WorkerResult<Vec<TaskId>> {
        uuids
            .iter()
            .map(|uuid| self.store.task_by_uuid(uuid).map(|task| task.id))
            .collect()
    }

    /// Runs one step of the state machine for `task_id`.
    pub async fn attempt_task(&self, task_id: TaskId) -> WorkerResult<AttemptOutcome> {
        let task = self.store.task(task_id)?;

        let unsatisfied = self.store.unsatisfied_prior_tasks(task_id)?;
        if !unsatisfied.is_empty() {
            debug!(
                task_uuid = %task.uuid,
                waiting_on = unsatisfied.len(),
                "Prior tasks not yet successful"
            );
            return Ok(AttemptOutcome::PriorTasksUnsatisfied {
                prior_tasks: unsatisfied.into_iter().map(|t| t.uuid).collect(),
            });
        }

        let wallet = self.wallets.wallet(task.signing_wallet_id)?;
        if let Some(topup) = self.ensure_topup(&wallet, Some(&task)).await? {
            self.store.add_dependency(topup.id, task.id)?;
            info!(
                task_uuid = %task.uuid,
                topup_uuid = %topup.uuid,
                wallet = %wallet.address,
                "Signing wallet needs a top-up first"
            );
            return Ok(AttemptOutcome::TopupRequired {
                topup_task: topup.uuid,
            });
        }

        let key = format!("TaskID-{task_id}");
        let Some(_guard) = self
            .locks
            .acquire(&key, self.settings.task_lock_ttl, self.settings.task_lock_wait)
            .await
        else {
            debug!(task_uuid = %task.uuid, "Task lock held elsewhere");
            return Ok(AttemptOutcome::LockNotAcquired);
        };

        let status = self.store.task_status(task_id)?;
        match status {
            TaskStatus::Success | TaskStatus::Pending => {
                debug!(task_uuid = %task.uuid, %status, "Task already in flight");
                return Ok(AttemptOutcome::AlreadyInProgress { status });
            }
            TaskStatus::Failed if self.round_exhausted(&task) => {
                debug!(task_uuid = %task.uuid, "Retry budget used up for this round");
                return Ok(AttemptOutcome::RetriesExhausted);
            }
            _ => {}
        }

        let txn = self.store.create_attempt(task_id)?;
        publish_transaction(self.publisher.as_ref(), &self.store, &txn).await;
        info!(task_uuid = %task.uuid, txn_id = txn.id, "Created transaction attempt");
        self.scheduler.schedule(
            Job::SubmitTransaction {
                txn_id: txn.id,
                retries: 0,
            },
            Duration::ZERO,
        );
        Ok(AttemptOutcome::Submitted { txn_id: txn.id })
    }

    fn round_exhausted(&self, task: &Task) -> bool {
        let attempts = self.store.task_attempts(task.id).len() as u32;
        let policy = &self.settings.retry;
        policy.is_exhausted(policy.attempts_this_round(attempts, task.previous_invocations))
    }

    /// A top-up that already succeeded as a prior of this task lets it
    /// through, even if the node still reports the old balance.
    fn topup_already_satisfied(&self, task: &Task, wallet: &Wallet) -> WorkerResult<bool> {
        let Some(uuid) = wallet.last_topup_task else {
            return Ok(false);
        };
        let topup = match self.store.task_by_uuid(&uuid) {
            Ok(topup) => topup,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(task.prior_tasks.contains(&topup.id)
            && self.store.task_status(topup.id)? == TaskStatus::Success)
    }

    /// Returns the top-up task `wallet` is waiting on, creating and queueing
    /// one if its balance has dropped to the threshold.
    ///
    /// The decision runs under the wallet's top-up lock so that concurrent
    /// attempts on one wallet share a single top-up. `task` is the attempt
    /// asking, if any.
    async fn ensure_topup(&self, wallet: &Wallet, task: Option<&Task>) -> WorkerResult<Option<Task>> {
        if !wallet.topup.is_active() {
            return Ok(None);
        }
        let Some(master) = self.master_wallet.as_ref() else {
            return Ok(None);
        };
        if master.id == wallet.id {
            return Ok(None);
        }

        let key = topup_lock_key(wallet);
        let _guard = self
            .locks
            .acquire(&key, self.settings.task_lock_ttl, self.settings.task_lock_wait)
            .await
            .ok_or_else(|| WorkerError::LockNotAcquired(key.clone()))?;

        // Re-read under the lock; another attempt may have queued a top-up.
        let wallet = self.wallets.wallet(wallet.id)?;
        if let Some(task) = task {
            let task = self.store.task(task.id)?;
            if self.topup_already_satisfied(&task, &wallet)? {
                return Ok(None);
            }
        }

        let balance = self.chain.balance(wallet.address).await?;
        let Some(shortfall) = wallet.topup.shortfall(balance) else {
            return Ok(None);
        };

        if let Some(uuid) = wallet.last_topup_task {
            match self.store.task_by_uuid(&uuid) {
                Ok(existing) => {
                    let status = self.store.task_status(existing.id)?;
                    if matches!(status, TaskStatus::Pending | TaskStatus::Unstarted) {
                        return Ok(Some(existing));
                    }
                }
                Err(err) if err.is_not_found() => {
                    warn!(wallet = %wallet.address, topup_uuid = %uuid, "Last top-up task is missing");
                }
                Err(err) => return Err(err),
            }
        }

        let (topup, _) = self.store.insert_task(NewTask {
            uuid: Uuid::new_v4(),
            kind: TaskKind::SendValue {
                recipient: wallet.address,
                amount: shortfall,
            },
            signing_wallet_id: master.id,
            reverses: None,
        });
        self.store
            .update_wallet(wallet.id, |w| w.last_topup_task = Some(topup.uuid))?;
        info!(
            wallet = %wallet.address,
            %balance,
            amount = %shortfall,
            topup_uuid = %topup.uuid,
            "Queued wallet top-up"
        );
        self.scheduler
            .schedule(Job::AttemptTask { task_id: topup.id }, Duration::ZERO);
        Ok(Some(topup))
    }

    /// Signs and broadcasts a prepared attempt, then schedules its receipt
    /// check.
    pub async fn submit_transaction(&self, txn_id: TransactionId, retries: u32) -> WorkerResult<()> {
        let txn = self.store.transaction(txn_id)?;
        let task_id = txn
            .task_id
            .ok_or_else(|| WorkerError::Internal(format!("transaction {txn_id} has no task")))?;
        if txn.status == TransactionStatus::Failed && txn.hash.is_none() {
            // Swept to FAILED by a nonce claim before it was broadcast.
            info!(txn_id, error = ?txn.error, "Attempt failed before submission");
            return self.fail_or_retry(task_id).await;
        }
        if txn.status != TransactionStatus::Pending {
            debug!(txn_id, status = %txn.status, "Attempt already resolved");
            return Ok(());
        }
        if txn.hash.is_some() {
            debug!(txn_id, "Attempt already broadcast");
            self.schedule_check(txn_id, 0);
            return Ok(());
        }

        let task = self.store.task(task_id)?;
        match self.submitter.submit(txn_id, &task.kind).await {
            Ok(_) => {
                self.schedule_check(txn_id, 0);
                Ok(())
            }
            Err(err) if err.is_transient() && retries < self.settings.max_submit_retries => {
                let delay = self.settings.poll.delay(retries);
                warn!(
                    task_uuid = %task.uuid,
                    txn_id,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.sanitized_message(),
                    "Submission hit a transient error, retrying"
                );
                self.scheduler.schedule(
                    Job::SubmitTransaction {
                        txn_id,
                        retries: retries + 1,
                    },
                    delay,
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    task_uuid = %task.uuid,
                    txn_id,
                    error = %err.sanitized_message(),
                    "Submission failed"
                );
                let failed = self.store.update_transaction(txn_id, |t| {
                    t.status = TransactionStatus::Failed;
                    t.error = Some(err.kind().to_string());
                    t.message = Some(err.sanitized_message());
                    t.nonce_consumed = false;
                })?;
                publish_transaction(self.publisher.as_ref(), &self.store, &failed).await;
                self.fail_or_retry(task_id).await
            }
        }
    }

    fn schedule_check(&self, txn_id: TransactionId, polls: u32) {
        self.scheduler.schedule(
            Job::CheckTransaction { txn_id, polls },
            self.settings.poll.delay(polls),
        );
    }

    /// Checks a broadcast attempt once and acts on the result.
    pub async fn check_transaction(&self, txn_id: TransactionId, polls: u32) -> WorkerResult<()> {
        let status = match self.poller.check_status(txn_id).await {
            Ok(status) => status,
            Err(err) if err.is_transient() => {
                warn!(
                    txn_id,
                    polls,
                    error = %err.sanitized_message(),
                    "Receipt check failed, rescheduling"
                );
                self.schedule_check(txn_id, polls + 1);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if !status.is_final() {
            self.schedule_check(txn_id, polls + 1);
            return Ok(());
        }
        let Some(task_id) = self.store.transaction(txn_id)?.task_id else {
            return Ok(());
        };
        if status.status == TransactionStatus::Success {
            self.on_success(task_id).await
        } else {
            self.fail_or_retry(task_id).await
        }
    }

    /// Caches SUCCESS and releases posterior tasks.
    pub async fn on_success(&self, task_id: TaskId) -> WorkerResult<()> {
        let task = self.store.update_task(task_id, |t| {
            t.status_text = Some(TaskStatus::Success.as_str().to_string())
        })?;
        let posteriors = self.store.unstarted_posterior_tasks(task_id)?;
        info!(
            task_uuid = %task.uuid,
            released = posteriors.len(),
            "Task succeeded"
        );
        for posterior in posteriors {
            self.scheduler
                .schedule(Job::AttemptTask { task_id: posterior.id }, Duration::ZERO);
        }
        Ok(())
    }

    /// Applies the retry policy after a failed attempt.
    ///
    /// Returns [`WorkerError::TaskRetriesExceeded`] once the round's budget
    /// is used up; the task stays FAILED until an explicit retry.
    pub async fn fail_or_retry(&self, task_id: TaskId) -> WorkerResult<()> {
        let task = self.store.task(task_id)?;
        let status = self.store.task_status(task_id)?;
        if matches!(status, TaskStatus::Success | TaskStatus::Pending) {
            debug!(task_uuid = %task.uuid, %status, "Another attempt is live, not retrying");
            return Ok(());
        }

        let attempts = self.store.task_attempts(task_id).len() as u32;
        let policy = &self.settings.retry;
        let this_round = policy.attempts_this_round(attempts, task.previous_invocations);
        if policy.is_exhausted(this_round) {
            self.store.update_task(task_id, |t| {
                if t.status_text.as_deref() != Some(TaskStatus::Success.as_str()) {
                    t.status_text = Some(TaskStatus::Failed.as_str().to_string());
                }
            })?;
            return Err(WorkerError::TaskRetriesExceeded {
                task_uuid: task.uuid,
                attempts: this_round,
            });
        }

        let delay = policy.backoff(this_round);
        info!(
            task_uuid = %task.uuid,
            attempt = this_round,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling new attempt"
        );
        self.scheduler.schedule(Job::AttemptTask { task_id }, delay);
        Ok(())
    }

    /// Starts a new invocation round for a task.
    pub fn retry_task(&self, uuid: &Uuid) -> WorkerResult<Task> {
        let task = self.store.task_by_uuid(uuid)?;
        let task = self.store.update_task(task.id, |t| {
            t.previous_invocations += 1;
            t.status_text = None;
        })?;
        info!(
            task_uuid = %task.uuid,
            invocation = task.previous_invocations,
            "Retrying task"
        );
        self.scheduler
            .schedule(Job::AttemptTask { task_id: task.id }, Duration::ZERO);
        Ok(task)
    }

    /// Re-queues FAILED tasks, and UNSTARTED ones if asked, in an id range.
    ///
    /// FAILED tasks start a new invocation round. UNSTARTED tasks have not
    /// used their current round and are only re-queued.
    pub fn retry_failed_tasks(
        &self,
        min_id: Option<TaskId>,
        max_id: Option<TaskId>,
        include_unstarted: bool,
    ) -> WorkerResult<RetrySummary> {
        let mut summary = RetrySummary::default();
        for task in self
            .store
            .tasks_in_range(min_id, max_id, &[TaskStatus::Failed])
        {
            self.retry_task(&task.uuid)?;
            summary.failed += 1;
        }
        if include_unstarted {
            for task in self
                .store
                .tasks_in_range(min_id, max_id, &[TaskStatus::Unstarted])
            {
                self.scheduler
                    .schedule(Job::AttemptTask { task_id: task.id }, Duration::ZERO);
                summary.unstarted += 1;
            }
        }
        info!(
            failed = summary.failed,
            unstarted = summary.unstarted,
            "Re-queued tasks"
        );
        Ok(summary)
    }

    /// Queues top-ups for every wallet at or below its threshold. Returns the
    /// number of wallets waiting on a top-up.
    pub async fn topup_wallets(&self) -> WorkerResult<usize> {
        let mut queued = 0;
        for wallet in self.store.wallets() {
            match self.ensure_topup(&wallet, None).await {
                Ok(Some(_)) => queued += 1,
                Ok(None) => {}
                Err(err) => warn!(
                    wallet = %wallet.address,
                    error = %err.sanitized_message(),
                    "Top-up check failed"
                ),
            }
        }
        Ok(queued)
    }

    pub fn get_task(&self, uuid: &Uuid) -> WorkerResult<TaskView> {
        let task = self.store.task_by_uuid(uuid)?;
        TaskView::build(&self.store, &task)
    }

    /// Read-only contract call.
    pub async fn call_contract_function(
        &self,
        contract_address: Address,
        abi_kind: &str,
        function: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        from: Option<Address>,
    ) -> WorkerResult<Vec<Value>> {
        self.submitter
            .call_contract_function(contract_address, abi_kind, function, args, kwargs, from)
            .await
    }

    /// Re-queues work lost across a restart: receipt checks for broadcast
    /// attempts, submissions for unbroadcast ones, and attempts for tasks
    /// that never started. Returns the number of jobs queued.
    pub fn recover(&self) -> usize {
        let mut queued = 0;
        for txn in self.store.pending_transactions() {
            if txn.hash.is_some() {
                self.schedule_check(txn.id, 0);
            } else {
                self.scheduler.schedule(
                    Job::SubmitTransaction {
                        txn_id: txn.id,
                        retries: 0,
                    },
                    Duration::ZERO,
                );
            }
            queued += 1;
        }
        for task in self
            .store
            .tasks_in_range(None, None, &[TaskStatus::Unstarted])
        {
            self.scheduler
                .schedule(Job::AttemptTask { task_id: task.id }, Duration::ZERO);
            queued += 1;
        }
        if queued > 0 {
            info!(queued, "Recovered in-flight work");
        }
        queued
    }
}
