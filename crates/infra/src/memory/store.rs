//! In-process store
//!
//! Values of any `Clone + Send + Sync` type share one map; each entry is
//! stored type-erased and downcast on read. Reads never remove anything: an
//! expired entry reads as a miss until the sweeper or an overwrite drops it.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use memora_common::{SharedClock, SystemClock};
use memora_core::{Entry, Store};
use memora_domain::{CacheKey, CacheResult};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

type ErasedValue = Arc<dyn Any + Send + Sync>;

static GLOBAL: Lazy<MemoryStore> = Lazy::new(MemoryStore::new);

pub(crate) struct Inner {
    pub(crate) entries: DashMap<CacheKey, Entry<ErasedValue>>,
    pub(crate) clock: SharedClock,
    /// Interval of the running sweeper, if any
    pub(crate) sweep_interval: Mutex<Option<Duration>>,
}

impl Inner {
    pub(crate) fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }
}

/// Process-local cache storage
///
/// Clones share the same map.
#[derive(Clone)]
pub struct MemoryStore {
    pub(crate) inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("entries", &self.len()).finish()
    }
}

impl MemoryStore {
    /// Empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Store reading time from `clock` (use a `MockClock` in tests)
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                clock,
                sweep_interval: Mutex::new(None),
            }),
        }
    }

    /// Process-wide store shared by every in-process memoizer
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Entries currently held, expired or not
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop every entry, fresh or not
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    fn fresh(&self, key: &CacheKey) -> Option<ErasedValue> {
        let now = self.inner.clock.now();
        let entry = self.inner.entries.get(key)?;
        if entry.is_expired_at(now) {
            return None;
        }
        Some(Arc::clone(entry.value().value()))
    }

    fn read<V: Clone + 'static>(&self, key: &CacheKey) -> Option<V> {
        let value = self.fresh(key)?;
        match value.downcast_ref::<V>() {
            Some(value) => Some(value.clone()),
            None => {
                debug!(
                    function_id = key.function_id(),
                    expected = std::any::type_name::<V>(),
                    "memory_store.type_mismatch"
                );
                None
            }
        }
    }

    fn write<V: Send + Sync + 'static>(&self, key: &CacheKey, value: V, ttl: Option<Duration>) {
        let entry = Entry::new(Arc::new(value) as ErasedValue, ttl, self.inner.clock.now());
        self.inner.entries.insert(key.clone(), entry);
    }
}

#[async_trait]
impl<V> Store<V> for MemoryStore
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        Ok(self.read(key))
    }

    fn set(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> CacheResult<()> {
        self.write(key, value, ttl);
        Ok(())
    }

    fn is_expired(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.fresh(key).is_none())
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.inner.entries.remove(key);
        Ok(())
    }

    async fn get_async(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        Ok(self.read(key))
    }

    async fn set_async(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> CacheResult<()> {
        self.write(key, value, ttl);
        Ok(())
    }

    async fn is_expired_async(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.fresh(key).is_none())
    }

    async fn remove_async(&self, key: &CacheKey) -> CacheResult<()> {
        self.inner.entries.remove(key);
        Ok(())
    }
}
