use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One asynchronous mutex per key, e.g. per aggregate identity or saga correlation id.
///
/// Holders of the same key are serialized, different keys never contend. Entries are dropped as
/// soon as nobody holds or waits for them.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, or waits for outstanding guards on it to be released.
    pub async fn lock(&self, key: &str) -> KeyedLockGuard {
        let mutex = Arc::clone(self.entries().entry(key.to_owned()).or_default());
        let guard = mutex.lock_owned().await;

        KeyedLockGuard {
            key: key.to_owned(),
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Number of keys currently held or waited for.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock guard preventing concurrent access to a key. The lock is released when dropped.
pub struct KeyedLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyedLocks,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut entries = self.locks.entries();
        let unused = entries
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1);
        if unused {
            entries.remove(&self.key);
        }
    }
}
