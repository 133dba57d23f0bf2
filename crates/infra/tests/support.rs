//! Shared fixtures for infra integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memora_common::MockClock;
use memora_core::{Memoizer, MemoizerBuilder, Refresher, Store};
use memora_domain::{FingerprintMode, RefreshSettings, RemoteSettings};
use memora_infra::{LeaseLock, LocalLocks, LoopbackKv, MemoryStore, RemoteConfig, RemoteStore};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Counts executions of a computation; clones share the count
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    /// Record one execution; returns the running total
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Isolated in-process backend driven by `clock`
pub struct MemoryFixture {
    pub store: MemoryStore,
    pub locks: LocalLocks,
    pub refresher: Refresher,
}

impl MemoryFixture {
    pub fn new(clock: &MockClock) -> Self {
        Self {
            store: MemoryStore::with_clock(clock.shared()),
            locks: LocalLocks::new(),
            refresher: Refresher::manual(clock.shared(), RefreshSettings::default()),
        }
    }

    pub fn builder<V>(&self, function_id: &str) -> MemoizerBuilder<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        Memoizer::builder(function_id)
            .store(Arc::new(self.store.clone()) as Arc<dyn Store<V>>)
            .lock(Arc::new(self.locks.clone()))
            .refresher(self.refresher.clone())
    }

    pub fn memoizer<V>(&self, function_id: &str, ttl_secs: f64) -> Memoizer<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.builder(function_id).ttl_secs(ttl_secs).build().unwrap()
    }
}

/// Remote configuration over `kv` with both clients
pub fn loopback_config(kv: &LoopbackKv, settings: RemoteSettings) -> Arc<RemoteConfig> {
    Arc::new(
        RemoteConfig::new(settings)
            .with_sync_client(Arc::new(kv.clone()))
            .with_async_client(Arc::new(kv.clone())),
    )
}

/// Builder on the networked backend with a fixed configuration
pub fn remote_builder<V>(
    function_id: &str,
    config: &Arc<RemoteConfig>,
    refresher: &Refresher,
) -> MemoizerBuilder<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    Memoizer::builder(function_id)
        .fingerprint_mode(FingerprintMode::Shared)
        .store(Arc::new(RemoteStore::with_config(Arc::clone(config))) as Arc<dyn Store<V>>)
        .lock(Arc::new(LeaseLock::with_config(Arc::clone(config))))
        .refresher(refresher.clone())
}

/// Memoizer on the networked backend with a fixed configuration
pub fn remote_memoizer<V>(
    function_id: &str,
    ttl_secs: f64,
    config: &Arc<RemoteConfig>,
    refresher: &Refresher,
) -> Memoizer<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    remote_builder(function_id, config, refresher).ttl_secs(ttl_secs).build().unwrap()
}
