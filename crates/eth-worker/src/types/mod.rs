//! Core worker types.
//!
//! This module contains the records the worker persists (wallets, tasks,
//! transaction attempts, sync filters) and the status model derived from
//! them.

mod status;
mod sync;
mod task;
mod transaction;
mod wallet;

pub use status::{derive_task_status, TaskStatus, TransactionStatus};
pub use sync::{BlockRangeStatus, FilterId, FilterKind, SyncFilter, SynchronizedBlock};
pub use task::{NewTask, Task, TaskId, TaskKind};
pub use transaction::{ThirdPartyTransfer, Transaction, TransactionId};
pub use wallet::{TopupPolicy, Wallet, WalletId};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds since the unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
