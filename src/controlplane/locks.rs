//! Per-resource lock table
//!
//! Critical sections inside a driver (create then map, rollback sequences)
//! are serialised by a lock keyed by a short string: a volume id, a task id
//! or a backend host. Entries are created on first use and removed when the
//! last holder or waiter goes away.

use crate::controlplane::jobs::Deadline;
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Guard held for the duration of a critical section
#[derive(Debug)]
pub struct ResourceGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release(&self.locks, &self.key);
    }
}

/// Remove `key` when only the table itself still references its mutex
fn release(locks: &LockMap, key: &str) {
    locks.remove_if(key, |_, m| Arc::strong_count(m) == 1);
}

/// Process-wide table of async mutexes keyed by resource id
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Arc<LockMap>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> ResourceGuard {
        ResourceGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Acquire the lock for `key`, waiting for any current holder
    pub async fn lock(&self, key: &str) -> ResourceGuard {
        debug!("Acquiring resource lock {}", key);
        let guard = self.mutex(key).lock_owned().await;
        self.guard(key, guard)
    }

    /// Acquire the lock for `key`, giving up with `Timeout` at `deadline`
    pub async fn lock_until(&self, key: &str, deadline: &Deadline) -> Result<ResourceGuard> {
        debug!("Acquiring resource lock {}", key);
        let mutex = self.mutex(key);

        match tokio::time::timeout(deadline.remaining(), mutex.lock_owned()).await {
            Ok(guard) => Ok(self.guard(key, guard)),
            Err(_) => {
                release(&self.locks, key);
                Err(deadline.timeout(format!("waiting for lock {}", key)))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialised() {
        let table = Arc::new(LockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = table.lock("vol-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let table = LockTable::new();
        let _a = table.lock("vol-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), table.lock("vol-b")).await;
        assert!(b.is_ok());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_entries_removed_when_released() {
        let table = LockTable::new();
        let held = table.lock("held").await;
        for i in 0..50 {
            drop(table.lock(&format!("vol-{}", i)).await);
        }
        assert_eq!(table.len(), 1);

        drop(held);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_until_times_out() {
        let table = LockTable::new();
        let held = table.lock("vol-1").await;
        let deadline = Deadline::after(Duration::from_secs(1));

        let err = table.lock_until("vol-1", &deadline).await.unwrap_err();

        assert_matches!(err, Error::Timeout { ref operation, .. } if operation.contains("vol-1"));
        assert!(deadline.elapsed() <= Duration::from_secs(1));
        assert_eq!(table.len(), 1);

        drop(held);
        assert!(table.is_empty());
        let fresh = Deadline::after(Duration::from_secs(1));
        assert!(table.lock_until("vol-1", &fresh).await.is_ok());
        assert!(table.is_empty());
    }
}
