//! Inbound request and response types.
//!
//! Requests arrive as JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "send_value", "uuid": "…", "recipient": "0x…", "amount": "100",
//!  "signing_address": "0x…", "prior_tasks": []}
//! ```

use crate::dedup::DedupSummary;
use crate::error::{WorkerError, WorkerResult};
use crate::store::Store;
use crate::supervisor::{CreateTask, RetrySummary};
use crate::sync::SyncSummary;
use crate::types::{
    derive_task_status, FilterKind, SyncFilter, Task, TaskKind, TaskStatus, Timestamp,
    Transaction, TransactionStatus,
};
use crate::wallet::WalletRef;
use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A request to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRequest {
    SendValue {
        uuid: Uuid,
        recipient: Address,
        amount: U256,
        #[serde(default)]
        signing_address: Option<Address>,
        #[serde(default)]
        encrypted_private_key: Option<String>,
        #[serde(default)]
        prior_tasks: Vec<Uuid>,
        #[serde(default)]
        posterior_tasks: Vec<Uuid>,
    },
    CallFunction {
        uuid: Uuid,
        contract_address: Address,
        abi_kind: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        #[serde(default)]
        gas_limit: Option<u64>,
        #[serde(default)]
        signing_address: Option<Address>,
        #[serde(default)]
        encrypted_private_key: Option<String>,
        #[serde(default)]
        prior_tasks: Vec<Uuid>,
        #[serde(default)]
        posterior_tasks: Vec<Uuid>,
        #[serde(default)]
        reverses_task: Option<Uuid>,
    },
    DeployContract {
        uuid: Uuid,
        contract_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        #[serde(default)]
        gas_limit: Option<u64>,
        #[serde(default)]
        signing_address: Option<Address>,
        #[serde(default)]
        encrypted_private_key: Option<String>,
        #[serde(default)]
        prior_tasks: Vec<Uuid>,
        #[serde(default)]
        posterior_tasks: Vec<Uuid>,
    },
    GetTask {
        uuid: Uuid,
    },
    RetryTask {
        uuid: Uuid,
    },
    RetryFailed {
        #[serde(default)]
        min_task_id: Option<u64>,
        #[serde(default)]
        max_task_id: Option<u64>,
        #[serde(default)]
        retry_unstarted: bool,
    },
    CreateWallet {
        #[serde(default)]
        private_key: Option<String>,
        #[serde(default)]
        allow_existing: bool,
        #[serde(default)]
        target_balance: U256,
        #[serde(default)]
        topup_threshold: U256,
    },
    CallContractFunction {
        contract_address: Address,
        abi_kind: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        #[serde(default)]
        signing_address: Option<Address>,
    },
    Deduplicate {
        #[serde(default)]
        min_task_id: Option<u64>,
        #[serde(default)]
        max_task_id: Option<u64>,
    },
    AddSyncFilter {
        contract_address: Address,
        #[serde(default)]
        filter_parameters: Option<Value>,
        #[serde(default = "default_filter_kind")]
        kind: FilterKind,
        decimals: u8,
        #[serde(default)]
        start_block: Option<u64>,
    },
    Sync,
}

fn default_filter_kind() -> FilterKind {
    FilterKind::Transfer
}

impl TaskRequest {
    /// Wire name of the request type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SendValue { .. } => "send_value",
            Self::CallFunction { .. } => "call_function",
            Self::DeployContract { .. } => "deploy_contract",
            Self::GetTask { .. } => "get_task",
            Self::RetryTask { .. } => "retry_task",
            Self::RetryFailed { .. } => "retry_failed",
            Self::CreateWallet { .. } => "create_wallet",
            Self::CallContractFunction { .. } => "call_contract_function",
            Self::Deduplicate { .. } => "deduplicate",
            Self::AddSyncFilter { .. } => "add_sync_filter",
            Self::Sync => "sync",
        }
    }

    /// The task creation this request asks for, if it creates a task.
    pub fn into_create_task(self) -> WorkerResult<Option<CreateTask>> {
        let request = match self {
            Self::SendValue {
                uuid,
                recipient,
                amount,
                signing_address,
                encrypted_private_key,
                prior_tasks,
                posterior_tasks,
            } => CreateTask {
                uuid,
                kind: TaskKind::SendValue { recipient, amount },
                signer: WalletRef::from_parts(signing_address, encrypted_private_key)?,
                prior_tasks,
                posterior_tasks,
                reverses: None,
            },
            Self::CallFunction {
                uuid,
                contract_address,
                abi_kind,
                function,
                args,
                kwargs,
                gas_limit,
                signing_address,
                encrypted_private_key,
                prior_tasks,
                posterior_tasks,
                reverses_task,
            } => CreateTask {
                uuid,
                kind: TaskKind::CallFunction {
                    contract_address,
                    abi_kind,
                    function,
                    args,
                    kwargs,
                    gas_limit,
                },
                signer: WalletRef::from_parts(signing_address, encrypted_private_key)?,
                prior_tasks,
                posterior_tasks,
                reverses: reverses_task,
            },
            Self::DeployContract {
                uuid,
                contract_name,
                args,
                kwargs,
                gas_limit,
                signing_address,
                encrypted_private_key,
                prior_tasks,
                posterior_tasks,
            } => CreateTask {
                uuid,
                kind: TaskKind::DeployContract {
                    contract_name,
                    args,
                    kwargs,
                    gas_limit,
                },
                signer: WalletRef::from_parts(signing_address, encrypted_private_key)?,
                prior_tasks,
                posterior_tasks,
                reverses: None,
            },
            _ => return Ok(None),
        };
        Ok(Some(request))
    }
}

/// One attempt as shown by `get_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub id: u64,
    pub status: TransactionStatus,
    pub hash: Option<B256>,
    pub nonce: Option<u64>,
    pub block_number: Option<u64>,
    pub contract_address: Option<Address>,
    pub error: Option<String>,
    pub message: Option<String>,
    pub submitted_at: Option<Timestamp>,
    pub mined_at: Option<Timestamp>,
}

impl From<&Transaction> for TransactionView {
    fn from(txn: &Transaction) -> Self {
        Self {
            id: txn.id,
            status: txn.status,
            hash: txn.hash,
            nonce: txn.nonce,
            block_number: txn.block_number,
            contract_address: txn.contract_address,
            error: txn.error.clone(),
            message: txn.message.clone(),
            submitted_at: txn.submitted_at,
            mined_at: txn.mined_at,
        }
    }
}

/// A task with its derived status and attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: u64,
    pub uuid: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    pub prior_tasks: Vec<Uuid>,
    pub posterior_tasks: Vec<Uuid>,
    pub transactions: Vec<TransactionView>,
    pub successful_hash: Option<B256>,
    pub successful_block: Option<u64>,
    pub contract_address: Option<Address>,
    pub previous_invocations: u32,
    pub reverses_task: Option<Uuid>,
}

impl TaskView {
    pub fn build(store: &Store, task: &Task) -> WorkerResult<Self> {
        let uuid_of = |id: &u64| store.task(*id).map(|t| t.uuid);
        let attempts = store.task_attempts(task.id);
        let successful = attempts
            .iter()
            .find(|t| t.status == TransactionStatus::Success);

        Ok(Self {
            id: task.id,
            uuid: task.uuid,
            task_type: task.kind.type_name().to_string(),
            status: derive_task_status(attempts.iter().map(|t| t.status)),
            prior_tasks: task.prior_tasks.iter().map(uuid_of).collect::<Result<_, _>>()?,
            posterior_tasks: task
                .posterior_tasks
                .iter()
                .map(uuid_of)
                .collect::<Result<_, _>>()?,
            transactions: attempts.iter().map(TransactionView::from).collect(),
            successful_hash: successful.and_then(|t| t.hash),
            successful_block: successful.and_then(|t| t.block_number),
            contract_address: successful.and_then(|t| t.contract_address),
            previous_invocations: task.previous_invocations,
            reverses_task: task.reverses.as_ref().map(uuid_of).transpose()?,
        })
    }
}

/// Answer to a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResponse {
    TaskCreated { uuid: Uuid, id: u64 },
    Task(Box<TaskView>),
    Retried { uuid: Uuid, previous_invocations: u32 },
    RetriedFailed(RetrySummary),
    WalletCreated { address: Address, id: u64 },
    CallResult { outputs: Vec<Value> },
    Deduplicated(DedupSummary),
    FilterAdded(SyncFilter),
    Synced(SyncSummary),
    Error { kind: String, message: String },
}

impl From<WorkerError> for TaskResponse {
    fn from(err: WorkerError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.sanitized_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_value() {
        let uuid = Uuid::new_v4();
        let prior = Uuid::new_v4();
        let request: TaskRequest = serde_json::from_value(json!({
            "type": "send_value",
            "uuid": uuid,
            "recipient": Address::repeat_byte(1).to_string(),
            "amount": "0x64",
            "signing_address": Address::repeat_byte(2).to_string(),
            "prior_tasks": [prior],
        }))
        .unwrap();
        assert_eq!(request.type_name(), "send_value");

        let create = request.into_create_task().unwrap().unwrap();
        assert_eq!(create.uuid, uuid);
        assert_eq!(create.prior_tasks, vec![prior]);
        assert_eq!(create.signer, WalletRef::Address(Address::repeat_byte(2)));
        assert_eq!(
            create.kind,
            TaskKind::SendValue {
                recipient: Address::repeat_byte(1),
                amount: U256::from(100u64),
            }
        );
    }

    #[test]
    fn test_task_request_requires_signer() {
        let request: TaskRequest = serde_json::from_value(json!({
            "type": "deploy_contract",
            "uuid": Uuid::new_v4(),
            "contract_name": "Token",
        }))
        .unwrap();
        assert!(request.into_create_task().is_err());
    }

    #[test]
    fn test_non_task_requests() {
        let request: TaskRequest =
            serde_json::from_value(json!({"type": "retry_failed", "retry_unstarted": true}))
                .unwrap();
        assert_eq!(
            request,
            TaskRequest::RetryFailed {
                min_task_id: None,
                max_task_id: None,
                retry_unstarted: true,
            }
        );
        assert!(request.into_create_task().unwrap().is_none());

        let sync: TaskRequest = serde_json::from_value(json!({"type": "sync"})).unwrap();
        assert_eq!(sync, TaskRequest::Sync);
    }

    #[test]
    fn test_error_response_shape() {
        let response = TaskResponse::from(WorkerError::TaskNotFound("abc".to_string()));
        let json = serde_json::to_value(response).unwrap();
        assert_eq!(json["result"], "error");
        assert_eq!(json["kind"], "TaskNotFound");
    }
}
