//! Per-key local locks
//!
//! Two independent registries: parking_lot mutexes for blocking callers and
//! tokio mutexes for async callers. A blocking and an async caller for the
//! same key do not exclude each other. Mutexes are created on first use and
//! kept for the life of the registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use memora_core::{KeyedLock, LockGuard};
use memora_domain::{CacheKey, CacheResult};
use once_cell::sync::Lazy;

static GLOBAL: Lazy<LocalLocks> = Lazy::new(LocalLocks::new);

#[derive(Default)]
struct Pools {
    threads: DashMap<CacheKey, Arc<parking_lot::Mutex<()>>>,
    tasks: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

/// Registry of per-key mutexes; clones share the registry
#[derive(Clone, Default)]
pub struct LocalLocks {
    pools: Arc<Pools>,
}

impl std::fmt::Debug for LocalLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLocks")
            .field("thread_locks", &self.pools.threads.len())
            .field("task_locks", &self.pools.tasks.len())
            .finish()
    }
}

impl LocalLocks {
    /// Empty registry, independent of the global one
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Number of keys with a mutex in either pool
    pub fn len(&self) -> usize {
        self.pools.threads.len() + self.pools.tasks.len()
    }

    /// Whether no key has been locked yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every mutex; guards already handed out stay valid
    pub fn reset(&self) {
        self.pools.threads.clear();
        self.pools.tasks.clear();
    }

    fn thread_lock(&self, key: &CacheKey) -> Arc<parking_lot::Mutex<()>> {
        Arc::clone(self.pools.threads.entry(key.clone()).or_default().value())
    }

    fn task_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.pools.tasks.entry(key.clone()).or_default().value())
    }
}

#[async_trait]
impl KeyedLock for LocalLocks {
    fn acquire_blocking(&self, key: &CacheKey) -> CacheResult<LockGuard> {
        let mutex = self.thread_lock(key);
        Ok(LockGuard::new(mutex.lock_arc()))
    }

    async fn acquire(&self, key: &CacheKey) -> CacheResult<LockGuard> {
        let mutex = self.task_lock(key);
        Ok(LockGuard::new(mutex.lock_owned().await))
    }
}
