//! Duplicate-transfer sweep.
//!
//! A race between two attempts of one task can land both on chain. For
//! `transferFrom` calls the excess is compensated by reversal tasks that move
//! the amount back. Other call types are reported and left alone.

use crate::error::{WorkerError, WorkerResult};
use crate::scheduler::Job;
use crate::supervisor::TaskSupervisor;
use crate::types::{now_millis, NewTask, Task, TaskKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEDUPLICATE_LOCK: &str = "Deduplicate";
const REVERSIBLE_FUNCTION: &str = "transferFrom";

/// Counts returned by [`TaskSupervisor::deduplicate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSummary {
    /// Tasks with more than one SUCCESS attempt.
    pub duplicates: usize,
    /// Reversal tasks created by this sweep.
    pub reversals: Vec<Uuid>,
    /// Duplicates that cannot be reversed automatically.
    pub skipped: usize,
}

impl TaskSupervisor {
    /// Creates reversal tasks for duplicated `transferFrom` calls in the id
    /// range.
    ///
    /// Fails with [`WorkerError::LockNotAcquired`] while another sweep runs
    /// in this process.
    pub async fn deduplicate(
        &self,
        min_id: Option<u64>,
        max_id: Option<u64>,
    ) -> WorkerResult<DedupSummary> {
        let _guard = self
            .locks
            .try_acquire(DEDUPLICATE_LOCK, self.settings.dedup_lock_ttl)
            .ok_or_else(|| WorkerError::LockNotAcquired(DEDUPLICATE_LOCK.to_string()))?;

        let mut summary = DedupSummary::default();
        for (task, successes) in self.store.duplicate_success_tasks(min_id, max_id) {
            summary.duplicates += 1;

            let Some(reversal) = reversal_kind(&task) else {
                info!(
                    task_uuid = %task.uuid,
                    task_type = task.kind.type_name(),
                    function = ?task.kind.function_name(),
                    successes,
                    "Duplicate is not a transferFrom, skipping reversal"
                );
                summary.skipped += 1;
                continue;
            };
            let reversal = match reversal {
                Ok(kind) => kind,
                Err(err) => {
                    warn!(
                        task_uuid = %task.uuid,
                        error = %err.sanitized_message(),
                        "Cannot build reversal"
                    );
                    summary.skipped += 1;
                    continue;
                }
            };

            let ttl = self.settings.reversal_claim_ttl.as_millis() as u64;
            if !self.store.try_claim_reversal(task.id, now_millis(), ttl) {
                debug!(task_uuid = %task.uuid, "Reversal claimed by another sweep");
                continue;
            }

            let existing = self.store.reversal_tasks(task.id).len();
            let required = successes.saturating_sub(1).saturating_sub(existing);
            for _ in 0..required {
                let (created, _) = self.store.insert_task(NewTask {
                    uuid: Uuid::new_v4(),
                    kind: reversal.clone(),
                    signing_wallet_id: task.signing_wallet_id,
                    reverses: Some(task.id),
                });
                info!(
                    task_uuid = %task.uuid,
                    reversal_uuid = %created.uuid,
                    "Created reversal task"
                );
                self.scheduler
                    .schedule(Job::AttemptTask { task_id: created.id }, Duration::ZERO);
                summary.reversals.push(created.uuid);
            }
        }
        Ok(summary)
    }
}

/// The reversing call for a duplicated `transferFrom`, or `None` for any
/// other task.
fn reversal_kind(task: &Task) -> Option<WorkerResult<TaskKind>> {
    let TaskKind::CallFunction {
        contract_address,
        abi_kind,
        function,
        args,
        kwargs,
        gas_limit,
    } = &task.kind
    else {
        return None;
    };
    if function != REVERSIBLE_FUNCTION {
        return None;
    }
    Some(reversal_args(args, kwargs).map(|args| TaskKind::CallFunction {
        contract_address: *contract_address,
        abi_kind: abi_kind.clone(),
        function: function.clone(),
        args,
        kwargs: Map::new(),
        gas_limit: *gas_limit,
    }))
}

/// `transferFrom(from, to, amount)` becomes `transferFrom(to, from, amount)`.
fn reversal_args(args: &[Value], kwargs: &Map<String, Value>) -> WorkerResult<Vec<Value>> {
    let pick = |index: usize, names: &[&str]| {
        args.get(index)
            .or_else(|| names.iter().find_map(|name| kwargs.get(*name)))
            .cloned()
            .ok_or_else(|| {
                WorkerError::abi(format!("transferFrom call is missing `{}`", names[0]))
            })
    };
    let sender = pick(0, &["from", "sender"])?;
    let recipient = pick(1, &["to", "recipient"])?;
    let amount = pick(2, &["amount", "value"])?;
    Ok(vec![recipient, sender, amount])
}
