//! Networked store
//!
//! Entries are written as JSON [`WireEntry`] documents with a native expiry
//! one second past the logical deadline, so the key never disappears while
//! the entry is still fresh. Freshness itself is decided from the embedded
//! wall-clock deadline.
//!
//! Backend and decode failures follow the configured [`OnError`] policy.
//! Failing to encode the value being written is always returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memora_core::{Store, WireEntry};
use memora_domain::{CacheError, CacheKey, CacheResult, OnError};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::debug;

use super::config::{ConfigSource, RemoteConfig};

/// Store backed by the key/value server
#[derive(Debug, Clone)]
pub struct RemoteStore {
    source: ConfigSource,
}

impl RemoteStore {
    /// Store using whatever configuration is installed when it is called
    pub fn global() -> Self {
        Self { source: ConfigSource::Global }
    }

    /// Store bound to `config` instead of the global one
    pub fn with_config(config: Arc<RemoteConfig>) -> Self {
        Self { source: ConfigSource::Fixed(config) }
    }
}

fn degrade<T>(
    config: &RemoteConfig,
    key: &CacheKey,
    operation: &'static str,
    error: CacheError,
    fallback: T,
) -> CacheResult<T> {
    match config.settings().on_error {
        OnError::Raise => Err(error),
        OnError::Silent => {
            debug!(
                function_id = key.function_id(),
                digest = key.digest(),
                operation,
                error = %error,
                "remote_store.backend_error"
            );
            Ok(fallback)
        }
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> CacheResult<WireEntry<T>> {
    serde_json::from_slice(raw)
        .map_err(|e| CacheError::Serialization(format!("failed to decode cache entry: {e}")))
}

fn encode<V: Serialize>(entry: &WireEntry<V>) -> CacheResult<Vec<u8>> {
    serde_json::to_vec(entry)
        .map_err(|e| CacheError::Serialization(format!("failed to encode cache entry: {e}")))
}

/// Fresh value from a raw document; `None` when absent or expired
fn fresh_value<V: DeserializeOwned>(
    config: &RemoteConfig,
    key: &CacheKey,
    raw: Option<Vec<u8>>,
) -> CacheResult<Option<V>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match decode::<V>(&raw) {
        Ok(entry) if entry.is_expired_at(config.clock().unix_secs()) => Ok(None),
        Ok(entry) => Ok(Some(entry.value)),
        Err(e) => degrade(config, key, "get", e, None),
    }
}

fn expired_document(
    config: &RemoteConfig,
    key: &CacheKey,
    raw: Option<Vec<u8>>,
) -> CacheResult<bool> {
    let Some(raw) = raw else {
        return Ok(true);
    };
    match decode::<IgnoredAny>(&raw) {
        Ok(entry) => Ok(entry.is_expired_at(config.clock().unix_secs())),
        Err(e) => degrade(config, key, "is_expired", e, true),
    }
}

fn prepare<V: Serialize>(
    config: &RemoteConfig,
    value: V,
    ttl: Option<Duration>,
) -> CacheResult<(Vec<u8>, Option<Duration>)> {
    let entry = WireEntry::new(value, ttl, config.clock().unix_secs());
    let native_ttl = entry.native_ttl_secs().map(Duration::from_secs);
    Ok((encode(&entry)?, native_ttl))
}

#[async_trait]
impl<V> Store<V> for RemoteStore
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn get(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let config = self.source.resolve()?;
        let client = config.sync_client()?;
        match client.get(&config.entry_key(key)) {
            Ok(raw) => fresh_value(&config, key, raw),
            Err(e) => degrade(&config, key, "get", e, None),
        }
    }

    fn set(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> CacheResult<()> {
        let config = self.source.resolve()?;
        let client = config.sync_client()?;
        let (payload, native_ttl) = prepare(&config, value, ttl)?;
        client
            .set(&config.entry_key(key), &payload, native_ttl)
            .or_else(|e| degrade(&config, key, "set", e, ()))
    }

    fn is_expired(&self, key: &CacheKey) -> CacheResult<bool> {
        let config = self.source.resolve()?;
        let client = config.sync_client()?;
        match client.get(&config.entry_key(key)) {
            Ok(raw) => expired_document(&config, key, raw),
            Err(e) => degrade(&config, key, "is_expired", e, true),
        }
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        let config = self.source.resolve()?;
        let client = config.sync_client()?;
        client.delete(&config.entry_key(key)).or_else(|e| degrade(&config, key, "remove", e, ()))
    }

    async fn get_async(&self, key: &CacheKey) -> CacheResult<Option<V>> {
        let config = self.source.resolve()?;
        let client = config.async_client()?;
        match client.get(&config.entry_key(key)).await {
            Ok(raw) => fresh_value(&config, key, raw),
            Err(e) => degrade(&config, key, "get", e, None),
        }
    }

    async fn set_async(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> CacheResult<()> {
        let config = self.source.resolve()?;
        let client = config.async_client()?;
        let (payload, native_ttl) = prepare(&config, value, ttl)?;
        match client.set(&config.entry_key(key), &payload, native_ttl).await {
            Ok(()) => Ok(()),
            Err(e) => degrade(&config, key, "set", e, ()),
        }
    }

    async fn is_expired_async(&self, key: &CacheKey) -> CacheResult<bool> {
        let config = self.source.resolve()?;
        let client = config.async_client()?;
        match client.get(&config.entry_key(key)).await {
            Ok(raw) => expired_document(&config, key, raw),
            Err(e) => degrade(&config, key, "is_expired", e, true),
        }
    }

    async fn remove_async(&self, key: &CacheKey) -> CacheResult<()> {
        let config = self.source.resolve()?;
        let client = config.async_client()?;
        match client.delete(&config.entry_key(key)).await {
            Ok(()) => Ok(()),
            Err(e) => degrade(&config, key, "remove", e, ()),
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for remote::store.
    use memora_common::MockClock;
    use memora_domain::RemoteSettings;

    use super::*;
    use crate::remote::{KvClient, LoopbackKv};

    fn setup(on_error: OnError) -> (RemoteStore, LoopbackKv, MockClock) {
        let clock = MockClock::new();
        let kv = LoopbackKv::with_clock(clock.shared());
        let config = RemoteConfig::new(RemoteSettings { on_error, ..RemoteSettings::default() })
            .with_sync_client(Arc::new(kv.clone()))
            .with_async_client(Arc::new(kv.clone()))
            .with_clock(clock.shared());
        (RemoteStore::with_config(Arc::new(config)), kv, clock)
    }

    fn key() -> CacheKey {
        CacheKey::new("prices::quote", "ab12")
    }

    #[test]
    fn test_round_trip_with_native_ttl() {
        let (store, kv, clock) = setup(OnError::Silent);

        Store::<Vec<u32>>::set(&store, &key(), vec![1, 2, 3], Some(Duration::from_millis(2_500)))
            .unwrap();

        let native = KvClient::ttl(&kv, "cache:prices::quote:ab12").unwrap();
        assert_eq!(native, Some(Duration::from_secs(3)));
        assert_eq!(Store::<Vec<u32>>::get(&store, &key()).unwrap(), Some(vec![1, 2, 3]));

        clock.advance(Duration::from_millis(2_600));
        assert_eq!(Store::<Vec<u32>>::get(&store, &key()).unwrap(), None);
        assert!(Store::<Vec<u32>>::is_expired(&store, &key()).unwrap());
    }

    #[test]
    fn test_entry_without_ttl_has_no_native_expiry() {
        let (store, kv, _clock) = setup(OnError::Silent);

        Store::<String>::set(&store, &key(), "v".to_string(), None).unwrap();

        assert_eq!(KvClient::ttl(&kv, "cache:prices::quote:ab12").unwrap(), None);
        assert!(!Store::<String>::is_expired(&store, &key()).unwrap());
    }

    #[test]
    fn test_unbounded_ttl_is_stored() {
        let (store, _kv, clock) = setup(OnError::Raise);

        Store::<u32>::set(&store, &key(), 11, Some(Duration::MAX)).unwrap();
        clock.advance(Duration::from_secs(86_400 * 365));

        assert_eq!(Store::<u32>::get(&store, &key()).unwrap(), Some(11));
    }

    #[test]
    fn test_silent_mode_degrades_to_miss() {
        let (store, kv, _clock) = setup(OnError::Silent);
        kv.set_failing(true);

        assert_eq!(Store::<u32>::get(&store, &key()).unwrap(), None);
        assert!(Store::<u32>::set(&store, &key(), 7, None).is_ok());
        assert!(Store::<u32>::is_expired(&store, &key()).unwrap());
    }

    #[test]
    fn test_raise_mode_propagates() {
        let (store, kv, _clock) = setup(OnError::Raise);
        kv.set_failing(true);

        assert!(Store::<u32>::get(&store, &key()).unwrap_err().is_backend());
        assert!(Store::<u32>::set(&store, &key(), 7, None).unwrap_err().is_backend());
    }

    #[test]
    fn test_corrupt_document_follows_policy() {
        let (silent, kv, _clock) = setup(OnError::Silent);
        KvClient::set(&kv, "cache:prices::quote:ab12", b"not json", None).unwrap();
        assert_eq!(Store::<u32>::get(&silent, &key()).unwrap(), None);

        let (raise, kv, _clock) = setup(OnError::Raise);
        KvClient::set(&kv, "cache:prices::quote:ab12", b"not json", None).unwrap();
        let err = Store::<u32>::get(&raise, &key()).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_unencodable_value_always_fails() {
        let (store, _kv, _clock) = setup(OnError::Silent);
        let mut bad = std::collections::HashMap::new();
        bad.insert((1_u8, 2_u8), 3_u8);

        let err = Store::set(&store, &key(), bad, None).unwrap_err();

        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (store, _kv, _clock) = setup(OnError::Silent);

        Store::<u64>::set_async(&store, &key(), 99, Some(Duration::from_secs(5))).await.unwrap();

        assert_eq!(Store::<u64>::get_async(&store, &key()).await.unwrap(), Some(99));
        Store::<u64>::remove_async(&store, &key()).await.unwrap();
        assert!(Store::<u64>::is_expired_async(&store, &key()).await.unwrap());
    }
}
