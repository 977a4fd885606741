//! Transaction and task statuses.
//!
//! A task never stores its status as ground truth: [`derive_task_status`]
//! computes it from the statuses of its attempts, lowest code wins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one on-chain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Submitted (or about to be) and awaiting a receipt.
    Pending,
    /// Mined with a success receipt.
    Success,
    /// Rejected before broadcast, reverted, or expired.
    Failed,
    /// Not yet classified.
    Unknown,
}

impl TransactionStatus {
    /// Returns the wire name used in webhook payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task, derived from its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// An attempt was confirmed.
    Success,
    /// The best attempt is awaiting confirmation.
    Pending,
    /// No attempts yet.
    Unstarted,
    /// Every attempt failed.
    Failed,
    /// Attempts exist but none is classified.
    Unknown,
}

impl TaskStatus {
    /// Ranking code. Lower codes outrank higher ones.
    pub fn code(&self) -> u8 {
        match self {
            Self::Success => 1,
            Self::Pending => 2,
            Self::Unstarted => 3,
            Self::Failed => 4,
            Self::Unknown => 99,
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Pending => "PENDING",
            Self::Unstarted => "UNSTARTED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl From<TransactionStatus> for TaskStatus {
    fn from(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Pending => Self::Pending,
            TransactionStatus::Success => Self::Success,
            TransactionStatus::Failed => Self::Failed,
            TransactionStatus::Unknown => Self::Unknown,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives a task status from the statuses of its attempts: the attempt with
/// the lowest code wins, and a task without attempts is unstarted.
pub fn derive_task_status<I>(attempts: I) -> TaskStatus
where
    I: IntoIterator<Item = TransactionStatus>,
{
    attempts
        .into_iter()
        .map(TaskStatus::from)
        .min_by_key(TaskStatus::code)
        .unwrap_or(TaskStatus::Unstarted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionStatus::*;

    #[test]
    fn test_no_attempts_is_unstarted() {
        assert_eq!(derive_task_status([]), TaskStatus::Unstarted);
    }

    #[test]
    fn test_lowest_code_wins() {
        assert_eq!(derive_task_status([Failed, Pending]), TaskStatus::Pending);
        assert_eq!(
            derive_task_status([Failed, Success, Pending]),
            TaskStatus::Success
        );
        assert_eq!(derive_task_status([Failed, Failed]), TaskStatus::Failed);
        assert_eq!(derive_task_status([Unknown, Failed]), TaskStatus::Failed);
        assert_eq!(derive_task_status([Unknown]), TaskStatus::Unknown);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::from_str::<TaskStatus>("\"UNSTARTED\"").unwrap(),
            TaskStatus::Unstarted
        );
        assert_eq!(TaskStatus::Failed.to_string(), "FAILED");
    }
}
