//! Small synchronization primitives shared by the lanes.
//!
//! - `ShutdownSignal`: a latch that sleeping workers can wait on.
//! - `KeyedLocks`: per-key mutual exclusion without a global lock on the hot path.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_SHARDS: usize = 16;

// ----------------------------------------------------------------------------
// ShutdownSignal
// ----------------------------------------------------------------------------

/// One-way latch. Once triggered it stays triggered.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut flag = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *flag = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless shutdown is triggered first.
    /// Returns true when woken by shutdown.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut flag = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(flag, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            flag = guard;
        }
        true
    }
}

// ----------------------------------------------------------------------------
// KeyedLocks
// ----------------------------------------------------------------------------

/// Sharded table of per-key mutexes.
///
/// Two operations on the same key are serialized; operations on different keys only
/// contend on the shard map for the duration of a lookup.
pub struct KeyedLocks {
    shards: Vec<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, Arc<Mutex<()>>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut shard = self
            .shard_for(key)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Drop entries nobody else references so the table does not grow unbounded.
        shard.retain(|k, v| k == key || Arc::strong_count(v) > 1);
        shard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_key<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.entry(key);
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}
