use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on demand.
///
/// The returned guard is owned, so it can travel across `.await`s and is
/// released on every exit path when dropped.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops locks nobody holds or waits for.
    pub fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let held = locks.lock(&"a").await;
        let wait = Duration::from_millis(20);
        assert!(tokio::time::timeout(wait, locks.lock(&"a")).await.is_err());
        assert!(tokio::time::timeout(wait, locks.lock(&"b")).await.is_ok());
        drop(held);
        assert!(tokio::time::timeout(wait, locks.lock(&"a")).await.is_ok());
    }

    #[tokio::test]
    async fn waiter_runs_after_release() {
        let locks = Arc::new(KeyedLocks::new());
        let entered = Arc::new(AtomicBool::new(false));
        let held = locks.lock(&1u8).await;

        let waiter = {
            let (locks, entered) = (locks.clone(), entered.clone());
            tokio::spawn(async move {
                let _guard = locks.lock(&1u8).await;
                entered.store(true, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!entered.load(Ordering::SeqCst));

        drop(held);
        waiter.await.unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = KeyedLocks::new();
        let held = locks.lock(&"busy").await;
        drop(locks.lock(&"idle").await);
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
