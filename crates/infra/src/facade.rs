//! Ready-made memoizer builders
//!
//! [`memory_cache`] and [`remote_cache`] return a [`MemoizerBuilder`] with
//! the backend already chosen; callers only add TTL and key options.
//!
//! The `_with_settings` variants also configure the process-wide services
//! (sweeper interval, global refresher). Those are shared, so the first
//! settings to reach them win and different settings afterwards are a
//! configuration error.
//!
//! ```
//! use memora_domain::CallArgs;
//! use memora_infra::facade::memory_cache;
//!
//! let square = memory_cache::<i64>("docs::square").ttl_secs(30.0).build().unwrap();
//! let value = square
//!     .call_blocking(CallArgs::new().arg("x", 7), || Ok::<_, std::io::Error>(49))
//!     .unwrap();
//! assert_eq!(value, 49);
//! ```

use std::sync::Arc;
use std::time::Duration;

use memora_core::{Memoizer, MemoizerBuilder, Refresher, Store};
use memora_domain::constants::DEFAULT_SWEEP_INTERVAL_SECS;
use memora_domain::{CacheResult, FingerprintMode, MemoraSettings};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::memory::{LocalLocks, MemoryStore};
use crate::remote::{LeaseLock, RemoteStore};

/// Process-local caching: global store and locks, identity-aware keys
///
/// Starts the global store's sweeper on first use.
pub fn memory_cache<V>(function_id: impl Into<Arc<str>>) -> MemoizerBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    let store = MemoryStore::global();
    store.start_sweeper(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS));
    memory_builder(function_id, store)
}

/// [`memory_cache`] configured from loaded settings
///
/// Applies the default TTL, and runs the global sweeper and refresher with
/// the settings' interval and backoff.
pub fn memory_cache_with_settings<V>(
    function_id: impl Into<Arc<str>>,
    settings: &MemoraSettings,
) -> CacheResult<MemoizerBuilder<V>>
where
    V: Clone + Send + Sync + 'static,
{
    settings.validate()?;
    let store = MemoryStore::global();
    store.require_sweeper(settings.memory.sweep_interval())?;
    let refresher = Refresher::init_global(settings.refresh.clone())?;

    Ok(memory_builder(function_id, store)
        .refresher(refresher)
        .ttl_secs(settings.default_ttl_secs))
}

fn memory_builder<V>(function_id: impl Into<Arc<str>>, store: MemoryStore) -> MemoizerBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    Memoizer::builder(function_id)
        .fingerprint_mode(FingerprintMode::Isolated)
        .store(Arc::new(store) as Arc<dyn Store<V>>)
        .lock(Arc::new(LocalLocks::global()))
}

/// Cross-process caching through the installed remote configuration
///
/// The configuration is resolved on every call, so the builder can be used
/// before `setup_remote_config`; calls fail with a configuration error
/// until it is.
pub fn remote_cache<V>(function_id: impl Into<Arc<str>>) -> MemoizerBuilder<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    Memoizer::builder(function_id)
        .fingerprint_mode(FingerprintMode::Shared)
        .store(Arc::new(RemoteStore::global()) as Arc<dyn Store<V>>)
        .lock(Arc::new(LeaseLock::global()))
}

/// [`remote_cache`] with the default TTL and refresh settings from
/// `settings`
///
/// Remote settings travel with the installed `RemoteConfig`, not here.
pub fn remote_cache_with_settings<V>(
    function_id: impl Into<Arc<str>>,
    settings: &MemoraSettings,
) -> CacheResult<MemoizerBuilder<V>>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    settings.validate()?;
    let refresher = Refresher::init_global(settings.refresh.clone())?;
    Ok(remote_cache(function_id).refresher(refresher).ttl_secs(settings.default_ttl_secs))
}
