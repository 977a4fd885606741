use super::{Timestamp, WalletId};
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Internal, monotonically assigned task id.
pub type TaskId = u64;

/// What a task asks the chain to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Plain value transfer in wei.
    SendValue { recipient: Address, amount: U256 },
    /// State-changing contract call.
    CallFunction {
        contract_address: Address,
        abi_kind: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        #[serde(default)]
        gas_limit: Option<u64>,
    },
    /// Contract creation from a registered contract.
    DeployContract {
        contract_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
        #[serde(default)]
        gas_limit: Option<u64>,
    },
}

impl TaskKind {
    /// Returns the wire name of the task type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SendValue { .. } => "SEND_VALUE",
            Self::CallFunction { .. } => "CALL_FUNCTION",
            Self::DeployContract { .. } => "DEPLOY_CONTRACT",
        }
    }

    /// Function name for contract calls.
    pub fn function_name(&self) -> Option<&str> {
        match self {
            Self::CallFunction { function, .. } => Some(function),
            _ => None,
        }
    }
}

/// A unit of work requested by the application.
///
/// Core parameters never change after creation. The supervisor owns the
/// invocation counter, the dependency edges and the cached status text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub uuid: Uuid,
    pub kind: TaskKind,
    pub signing_wallet_id: WalletId,
    /// Denormalised SUCCESS/FAILED marker. Never used to derive status.
    pub status_text: Option<String>,
    pub previous_invocations: u32,
    /// The task whose duplicate effect this task compensates.
    pub reverses: Option<TaskId>,
    pub prior_tasks: BTreeSet<TaskId>,
    pub posterior_tasks: BTreeSet<TaskId>,
    pub created_at: Timestamp,
}

/// Parameters for inserting a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub uuid: Uuid,
    pub kind: TaskKind,
    pub signing_wallet_id: WalletId,
    pub reverses: Option<TaskId>,
}
