//! Delayed job queue.
//!
//! Components never sleep on behalf of future work. They compute a
//! countdown and hand a [`Job`] to a [`Scheduler`], which delivers it to the
//! worker loop once the countdown has elapsed.

use crate::types::{TaskId, TransactionId};
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A unit of work for the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Run the supervisor state machine for a task.
    AttemptTask { task_id: TaskId },
    /// Sign and broadcast a prepared transaction row. `retries` counts
    /// earlier transient failures of this submission.
    SubmitTransaction { txn_id: TransactionId, retries: u32 },
    /// Check a broadcast transaction for a receipt.
    CheckTransaction { txn_id: TransactionId, polls: u32 },
    /// Run the third-party sync scanner.
    SyncThirdParty,
    /// Top up every wallet below its threshold.
    TopupWallets,
}

/// Accepts jobs for later execution.
pub trait Scheduler: Send + Sync + Debug {
    fn schedule(&self, job: Job, delay: Duration);
}

/// Delivers jobs into an unbounded channel, delaying with tokio timers.
///
/// Delayed jobs still waiting when the token is cancelled are dropped.
#[derive(Debug, Clone)]
pub struct QueueScheduler {
    sender: mpsc::UnboundedSender<Job>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl QueueScheduler {
    pub fn new(
        sender: mpsc::UnboundedSender<Job>,
        tracker: TaskTracker,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            sender,
            tracker,
            cancellation_token,
        }
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, job: Job, delay: Duration) {
        debug!(?job, delay_ms = delay.as_millis() as u64, "Scheduling job");
        if delay.is_zero() {
            if self.sender.send(job).is_err() {
                debug!("Job queue closed, dropping job");
            }
            return;
        }

        let sender = self.sender.clone();
        let token = self.cancellation_token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {
                    if sender.send(job).is_err() {
                        debug!("Job queue closed, dropping delayed job");
                    }
                }
                _ = token.cancelled() => {
                    debug!(?job, "Dropping delayed job on shutdown");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_and_delayed_delivery() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let scheduler = QueueScheduler::new(sender, TaskTracker::new(), CancellationToken::new());

        scheduler.schedule(Job::SyncThirdParty, Duration::from_millis(30));
        scheduler.schedule(Job::AttemptTask { task_id: 1 }, Duration::ZERO);

        assert_eq!(receiver.recv().await, Some(Job::AttemptTask { task_id: 1 }));
        assert_eq!(receiver.recv().await, Some(Job::SyncThirdParty));
    }

    #[tokio::test]
    async fn test_cancellation_drops_delayed_jobs() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let scheduler = QueueScheduler::new(sender, tracker.clone(), token.clone());

        scheduler.schedule(Job::TopupWallets, Duration::from_secs(3600));
        token.cancel();
        tracker.close();
        tracker.wait().await;
        drop(scheduler);

        assert_eq!(receiver.recv().await, None);
    }
}
