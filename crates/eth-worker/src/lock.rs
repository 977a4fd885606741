//! Named, expiring mutual-exclusion locks.
//!
//! Locks follow the usual distributed-lock contract: a lock is taken with a
//! TTL, a holder that outlives its TTL loses the lock, and releasing only
//! succeeds with the token handed out at acquisition. Failing to acquire is
//! not an error; it means somebody else is handling the work.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Proof of ownership of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(u64);

/// Backend for named locks.
///
/// Implementations must be cheap and non-blocking; waiting is done by
/// [`Locks::acquire`].
pub trait LockService: Send + Sync + Debug {
    /// Takes `key` for `ttl` if it is free or its holder expired.
    fn try_lock(&self, key: &str, ttl: Duration) -> Option<LockToken>;

    /// Releases `key` if `token` still owns it.
    fn unlock(&self, key: &str, token: LockToken) -> bool;
}

/// In-process lock table.
#[derive(Debug, Default)]
pub struct LocalLockService {
    locks: Mutex<HashMap<String, (LockToken, Instant)>>,
    next_token: AtomicU64,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockService for LocalLockService {
    fn try_lock(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, expires_at)) = locks.get(key) {
            if *expires_at > now {
                return None;
            }
        }
        let token = LockToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        locks.insert(key.to_string(), (token, now + ttl));
        Some(token)
    }

    fn unlock(&self, key: &str, token: LockToken) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(key) {
            Some((held, _)) if *held == token => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Shared handle to a [`LockService`] with bounded-wait acquisition.
#[derive(Debug, Clone)]
pub struct Locks {
    service: Arc<dyn LockService>,
}

impl Default for Locks {
    fn default() -> Self {
        Self::new(Arc::new(LocalLockService::new()))
    }
}

impl Locks {
    pub fn new(service: Arc<dyn LockService>) -> Self {
        Self { service }
    }

    /// Tries to take `key`, polling until `wait` has elapsed.
    ///
    /// Returns `None` if the lock is still held elsewhere after `wait`.
    pub async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> Option<LockGuard> {
        let started = Instant::now();
        let mut interval = Duration::from_millis(5);
        loop {
            if let Some(token) = self.service.try_lock(key, ttl) {
                debug!(lock = key, "Acquired lock");
                return Some(LockGuard {
                    service: self.service.clone(),
                    key: key.to_string(),
                    token,
                });
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                debug!(lock = key, "Lock held elsewhere, giving up");
                return None;
            }
            sleep(interval.min(wait - elapsed)).await;
            interval = (interval * 2).min(Duration::from_millis(100));
        }
    }

    /// Takes `key` without waiting.
    pub fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        self.service.try_lock(key, ttl).map(|token| LockGuard {
            service: self.service.clone(),
            key: key.to_string(),
            token,
        })
    }
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    service: Arc<dyn LockService>,
    key: String,
    token: LockToken,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.service.unlock(&self.key, self.token) {
            warn!(lock = %self.key, "Lock expired before release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_until_released() {
        let locks = Locks::default();
        let guard = locks.try_acquire("TaskID-1", Duration::from_secs(10)).unwrap();
        assert!(locks.try_acquire("TaskID-1", Duration::from_secs(10)).is_none());
        assert!(locks.try_acquire("TaskID-2", Duration::from_secs(10)).is_some());
        drop(guard);
        assert!(locks.try_acquire("TaskID-1", Duration::from_secs(10)).is_some());
    }

    #[test]
    fn test_expired_lock_can_be_taken_and_stale_token_cannot_release() {
        let service = LocalLockService::new();
        let stale = service.try_lock("k", Duration::ZERO).unwrap();
        let fresh = service.try_lock("k", Duration::from_secs(10)).unwrap();
        assert!(!service.unlock("k", stale));
        assert!(service.try_lock("k", Duration::from_secs(10)).is_none());
        assert!(service.unlock("k", fresh));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = Locks::default();
        let guard = locks.try_acquire("wallet", Duration::from_secs(10)).unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("wallet", Duration::from_secs(10), Duration::from_secs(2))
                    .await
                    .is_some()
            })
        };
        sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_wait() {
        let locks = Locks::default();
        let _guard = locks.try_acquire("wallet", Duration::from_secs(10)).unwrap();
        let result = locks
            .acquire("wallet", Duration::from_secs(10), Duration::from_millis(30))
            .await;
        assert!(result.is_none());
    }
}
