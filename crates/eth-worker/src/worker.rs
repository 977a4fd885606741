//! The worker service.
//!
//! [`EthWorker`] wires the store, chain client, supervisor and sync scanner
//! together, runs the job loop and answers [`TaskRequest`]s.
//!
//! Every job runs as its own tracked tokio task. Stopping the worker cancels
//! delayed jobs and periodic ticks; [`EthWorker::wait`] lets in-flight jobs
//! finish and writes a final store snapshot.
//!
//! # Examples
//!
//! ```no_run
//! use eth_worker::api::TaskRequest;
//! use eth_worker::{EthWorkerBuilder, KeyCipher, WorkerConfig};
//! use uuid::Uuid;
//!
//! async fn example() -> eth_worker::WorkerResult<()> {
//!     let config = WorkerConfig::default()
//!         .with_rpc_url("http://127.0.0.1:8545")
//!         .with_encryption_key(KeyCipher::generate_key());
//!     let worker = EthWorkerBuilder::new(config).build().await?;
//!     let handle = worker.start()?;
//!
//!     let response = worker
//!         .handle_request(TaskRequest::GetTask { uuid: Uuid::new_v4() })
//!         .await;
//!     println!("{response:?}");
//!
//!     worker.stop()?;
//!     worker.wait().await?;
//!     handle.await.ok();
//!     Ok(())
//! }
//! ```

use crate::api::{TaskRequest, TaskResponse};
use crate::chain::abi::ContractRegistry;
use crate::chain::{ChainClient, RpcChainClient};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::lock::{LockService, Locks};
use crate::retry::RetryExecutor;
use crate::scheduler::{Job, QueueScheduler, Scheduler};
use crate::store::Store;
use crate::supervisor::TaskSupervisor;
use crate::sync::ThirdPartySyncScanner;
use crate::types::TopupPolicy;
use crate::wallet::WalletStore;
use crate::webhook::{NullPublisher, Publisher, WebhookPublisher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// See the module level comments.
pub struct EthWorkerBuilder {
    config: WorkerConfig,
    chain: Option<Arc<dyn ChainClient>>,
    publisher: Option<Arc<dyn Publisher>>,
    lock_service: Option<Arc<dyn LockService>>,
    store: Option<Arc<Store>>,
}

impl EthWorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            chain: None,
            publisher: None,
            lock_service: None,
            store: None,
        }
    }

    /// Use a custom chain client instead of JSON-RPC over HTTP.
    pub fn with_chain_client(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Use a custom callback publisher instead of the configured webhook.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Share locks with other workers through a custom lock service.
    pub fn with_lock_service(mut self, service: Arc<dyn LockService>) -> Self {
        self.lock_service = Some(service);
        self
    }

    /// Start from an existing store instead of the configured snapshot.
    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the worker. Talks to the chain once if no chain id is
    /// configured.
    pub async fn build(self) -> WorkerResult<EthWorker> {
        let config = self.config;
        config.validate()?;
        let cipher = Arc::new(config.key_cipher()?);

        let store = match (self.store, &config.snapshot_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(Store::load_snapshot(path)?),
            (None, None) => Arc::new(Store::new()),
        };

        let chain = match self.chain {
            Some(chain) => chain,
            None => Arc::new(RpcChainClient::new(config.rpc_url()?)) as Arc<dyn ChainClient>,
        };
        let chain_id = match config.chain_id {
            Some(id) => id,
            None => chain.chain_id().await?,
        };

        let publisher = match (self.publisher, &config.webhook) {
            (Some(publisher), _) => publisher,
            (None, Some(webhook)) => Arc::new(WebhookPublisher::new(
                webhook.url.clone(),
                webhook.username.clone(),
                webhook.secret.clone(),
                webhook.timeout(),
                RetryExecutor::new(webhook.retry_config()),
            )?) as Arc<dyn Publisher>,
            (None, None) => {
                warn!("No webhook configured, callbacks are only logged");
                Arc::new(NullPublisher)
            }
        };

        let mut registry = ContractRegistry::with_builtins()?;
        if let Some(dir) = &config.contracts_dir {
            registry = registry.load_dir(dir)?;
        }

        let locks = self.lock_service.map(Locks::new).unwrap_or_default();
        let wallets = WalletStore::new(store.clone(), cipher);
        let master_wallet = match &config.master_private_key {
            Some(key) => Some(wallets.create_wallet(Some(key.as_str()), true, TopupPolicy::default())?),
            None => None,
        };

        let cancellation_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let (job_sender, job_receiver) = mpsc::unbounded_channel();
        let scheduler = Arc::new(QueueScheduler::new(
            job_sender,
            task_tracker.clone(),
            cancellation_token.clone(),
        ));

        let supervisor = TaskSupervisor::new(
            store.clone(),
            wallets,
            chain.clone(),
            Arc::new(registry),
            publisher.clone(),
            scheduler.clone(),
            locks.clone(),
            master_wallet,
            config.supervisor_settings(chain_id),
        );
        let scanner = ThirdPartySyncScanner::new(
            store.clone(),
            chain,
            publisher,
            locks,
            config.sync,
        );

        info!(
            chain_id,
            rpc_url = %config.rpc_url,
            master_wallet = ?supervisor.master_wallet().map(|w| w.address),
            "Initialized eth worker"
        );

        Ok(EthWorker {
            config: Arc::new(config),
            store,
            supervisor,
            scanner,
            scheduler,
            cancellation_token,
            task_tracker,
            job_receiver: Arc::new(Mutex::new(Some(job_receiver))),
        })
    }
}

/// See the module level comments.
#[derive(Clone)]
pub struct EthWorker {
    config: Arc<WorkerConfig>,
    store: Arc<Store>,
    supervisor: TaskSupervisor,
    scanner: ThirdPartySyncScanner,
    scheduler: Arc<QueueScheduler>,
    /// Cancellation token for signaling shutdown.
    cancellation_token: CancellationToken,
    /// Tracks running jobs, delayed jobs and periodic ticks.
    task_tracker: TaskTracker,
    /// Taken by the job loop when it starts.
    job_receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<Job>>>>,
}

impl EthWorker {
    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn scanner(&self) -> &ThirdPartySyncScanner {
        &self.scanner
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Start the job loop.
    pub fn start(&self) -> WorkerResult<JoinHandle<WorkerResult<()>>> {
        if self.cancellation_token.is_cancelled() {
            return Err(WorkerError::Internal(
                "Worker token is already cancelled".to_string(),
            ));
        }

        let worker = self.clone();
        Ok(tokio::spawn(async move { worker.inner_loop().await }))
    }

    async fn inner_loop(&self) -> WorkerResult<()> {
        let mut receiver = self
            .job_receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| WorkerError::Internal("Worker has already been started".to_string()))?;

        self.supervisor.recover();
        self.spawn_ticker(
            Duration::from_secs(self.config.sync.interval_secs),
            Job::SyncThirdParty,
        );
        self.spawn_ticker(
            Duration::from_secs(self.config.topup_interval_secs),
            Job::TopupWallets,
        );
        self.spawn_snapshot_ticker();

        info!("Eth worker loop started");
        loop {
            tokio::select! {
                job = receiver.recv() => {
                    let Some(job) = job else {
                        warn!("Job queue disconnected, exiting worker loop");
                        break;
                    };
                    let worker = self.clone();
                    self.task_tracker.spawn(async move { worker.run_job(job).await });
                }
                _ = self.cancellation_token.cancelled() => {
                    info!("Received cancellation signal");
                    break;
                }
            }
        }

        info!("Eth worker loop terminated");
        Ok(())
    }

    fn spawn_ticker(&self, every: Duration, job: Job) {
        if every.is_zero() {
            return;
        }
        let scheduler = self.scheduler.clone();
        let token = self.cancellation_token.clone();
        self.task_tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.schedule(job.clone(), Duration::ZERO),
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    fn spawn_snapshot_ticker(&self) {
        if self.config.snapshot_path.is_none() || self.config.snapshot_interval_secs == 0 {
            return;
        }
        let worker = self.clone();
        self.task_tracker.spawn(async move {
            let mut ticker = interval(Duration::from_secs(worker.config.snapshot_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = worker.save_snapshot() {
                            warn!(error = %err.sanitized_message(), "Failed to save snapshot");
                        }
                    }
                    _ = worker.cancellation_token.cancelled() => break,
                }
            }
        });
    }

    /// Runs one job. Errors are logged; none of them stop the worker.
    pub async fn run_job(&self, job: Job) {
        debug!(?job, "Running job");
        let result = match &job {
            Job::AttemptTask { task_id } => self
                .supervisor
                .attempt_task(*task_id)
                .await
                .map(|outcome| debug!(task_id, ?outcome, "Attempted task")),
            Job::SubmitTransaction { txn_id, retries } => {
                self.supervisor.submit_transaction(*txn_id, *retries).await
            }
            Job::CheckTransaction { txn_id, polls } => {
                self.supervisor.check_transaction(*txn_id, *polls).await
            }
            Job::SyncThirdParty => self.scanner.sync().await.map(|_| ()),
            Job::TopupWallets => self.supervisor.topup_wallets().await.map(|_| ()),
        };

        match result {
            Ok(()) => {}
            Err(err @ WorkerError::TaskRetriesExceeded { .. }) => {
                error!(error = %err, "Task failed permanently");
            }
            Err(err) if err.is_transient() => {
                warn!(?job, error = %err.sanitized_message(), "Job hit a transient error");
                if let Job::AttemptTask { .. } = job {
                    self.scheduler
                        .schedule(job, self.config.poll.base_delay);
                }
            }
            Err(err) => {
                error!(?job, error = %err.sanitized_message(), "Job failed");
            }
        }
    }

    /// Answers a request. Failures are returned as [`TaskResponse::Error`].
    pub async fn handle_request(&self, request: TaskRequest) -> TaskResponse {
        let request_type = request.type_name();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    request = request_type,
                    error = %err.sanitized_message(),
                    "Request failed"
                );
                err.into()
            }
        }
    }

    async fn dispatch(&self, request: TaskRequest) -> WorkerResult<TaskResponse> {
        let response = match request {
            request @ (TaskRequest::SendValue { .. }
            | TaskRequest::CallFunction { .. }
            | TaskRequest::DeployContract { .. }) => {
                let create = request
                    .into_create_task()?
                    .ok_or_else(|| WorkerError::Internal("not a task request".to_string()))?;
                let task = self.supervisor.create_task(create)?;
                TaskResponse::TaskCreated {
                    uuid: task.uuid,
                    id: task.id,
                }
            }
            TaskRequest::GetTask { uuid } => {
                TaskResponse::Task(Box::new(self.supervisor.get_task(&uuid)?))
            }
            TaskRequest::RetryTask { uuid } => {
                let task = self.supervisor.retry_task(&uuid)?;
                TaskResponse::Retried {
                    uuid: task.uuid,
                    previous_invocations: task.previous_invocations,
                }
            }
            TaskRequest::RetryFailed {
                min_task_id,
                max_task_id,
                retry_unstarted,
            } => TaskResponse::RetriedFailed(self.supervisor.retry_failed_tasks(
                min_task_id,
                max_task_id,
                retry_unstarted,
            )?),
            TaskRequest::CreateWallet {
                private_key,
                allow_existing,
                target_balance,
                topup_threshold,
            } => {
                let policy = TopupPolicy {
                    target_balance,
                    topup_threshold,
                };
                let wallets = self.supervisor.wallets();
                let mut wallet =
                    wallets.create_wallet(private_key.as_deref(), allow_existing, policy)?;
                if policy.is_active() && wallet.topup != policy {
                    wallet =
                        wallets.set_topup_policy(&wallet.address, target_balance, topup_threshold)?;
                }
                TaskResponse::WalletCreated {
                    address: wallet.address,
                    id: wallet.id,
                }
            }
            TaskRequest::CallContractFunction {
                contract_address,
                abi_kind,
                function,
                args,
                kwargs,
                signing_address,
            } => TaskResponse::CallResult {
                outputs: self
                    .supervisor
                    .call_contract_function(
                        contract_address,
                        &abi_kind,
                        &function,
                        &args,
                        &kwargs,
                        signing_address,
                    )
                    .await?,
            },
            TaskRequest::Deduplicate {
                min_task_id,
                max_task_id,
            } => TaskResponse::Deduplicated(
                self.supervisor
                    .deduplicate(min_task_id, max_task_id)
                    .await?,
            ),
            TaskRequest::AddSyncFilter {
                contract_address,
                filter_parameters,
                kind,
                decimals,
                start_block,
            } => TaskResponse::FilterAdded(self.scanner.add_watch_filter(
                contract_address,
                filter_parameters,
                kind,
                decimals,
                start_block,
            )?),
            TaskRequest::Sync => TaskResponse::Synced(self.scanner.sync().await?),
        };
        Ok(response)
    }

    /// Writes the store to the configured snapshot file, if any.
    pub fn save_snapshot(&self) -> WorkerResult<()> {
        match &self.config.snapshot_path {
            Some(path) => self.store.save_snapshot(path),
            None => Ok(()),
        }
    }

    /// Stop the worker.
    pub fn stop(&self) -> WorkerResult<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(WorkerError::Internal("Worker is already stopped".to_string()));
        }

        info!("Stopping eth worker");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        Ok(())
    }

    /// Wait for in-flight jobs to finish, then write a final snapshot.
    pub async fn wait(&self) -> WorkerResult<()> {
        info!("Waiting for in-flight jobs to complete");
        self.task_tracker.wait().await;
        self.save_snapshot()
    }
}
