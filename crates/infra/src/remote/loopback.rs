//! In-process key/value server
//!
//! Implements both client ports against a local map with real expiry, so
//! the networked store and the lease can run without a server: in tests, in
//! single-process development, or as a stand-in while the server is down.
//! Failures can be injected with [`LoopbackKv::set_failing`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use memora_common::{SharedClock, SystemClock};
use memora_domain::{CacheError, CacheResult};

use super::client::{AsyncKvClient, KvClient};

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: &[u8], ttl: Option<Duration>, now: Instant) -> Self {
        Self { value: value.to_vec(), expires_at: ttl.and_then(|ttl| now.checked_add(ttl)) }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

struct Inner {
    entries: DashMap<String, Slot>,
    clock: SharedClock,
    failing: AtomicBool,
    operations: AtomicU64,
}

/// Local key/value server; clones share the same data
#[derive(Clone)]
pub struct LoopbackKv {
    inner: Arc<Inner>,
}

impl Default for LoopbackKv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackKv")
            .field("keys", &self.inner.entries.len())
            .field("failing", &self.inner.failing.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoopbackKv {
    /// Empty server on the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Empty server whose expiry follows `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                clock,
                failing: AtomicBool::new(false),
                operations: AtomicU64::new(0),
            }),
        }
    }

    /// Make every subsequent operation fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Operations attempted so far, failed ones included
    pub fn operations(&self) -> u64 {
        self.inner.operations.load(Ordering::SeqCst)
    }

    /// Live keys, for inspection in tests
    pub fn keys(&self) -> Vec<String> {
        let now = self.now();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    fn check(&self) -> CacheResult<()> {
        self.inner.operations.fetch_add(1, Ordering::SeqCst);
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("loopback server unavailable".to_string()));
        }
        Ok(())
    }

    fn get_now(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check()?;
        let now = self.now();
        self.inner.entries.remove_if(key, |_, slot| slot.is_expired(now));
        Ok(self.inner.entries.get(key).map(|slot| slot.value.clone()))
    }

    fn set_now(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        self.inner.entries.insert(key.to_string(), Slot::new(value, ttl, self.now()));
        Ok(())
    }

    fn delete_now(&self, key: &str) -> CacheResult<()> {
        self.check()?;
        self.inner.entries.remove(key);
        Ok(())
    }

    fn set_if_absent_now(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.check()?;
        let now = self.now();
        let slot = Slot::new(value, Some(ttl), now);
        let written = match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut existing) if existing.get().is_expired(now) => {
                existing.insert(slot);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        };
        Ok(written)
    }

    fn extend_if_owner_now(&self, key: &str, token: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.check()?;
        let now = self.now();
        let extended = match self.inner.entries.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) && slot.value == token => {
                slot.expires_at = now.checked_add(ttl);
                true
            }
            _ => false,
        };
        Ok(extended)
    }

    fn delete_if_owner_now(&self, key: &str, token: &[u8]) -> CacheResult<bool> {
        self.check()?;
        let now = self.now();
        let removed = self
            .inner
            .entries
            .remove_if(key, |_, slot| !slot.is_expired(now) && slot.value == token);
        Ok(removed.is_some())
    }

    fn ttl_now(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.check()?;
        let now = self.now();
        Ok(self
            .inner
            .entries
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now)))
    }
}

impl KvClient for LoopbackKv {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.get_now(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        self.set_now(key, value, ttl)
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.delete_now(key)
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.set_if_absent_now(key, value, ttl)
    }

    fn extend_if_owner(&self, key: &str, token: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.extend_if_owner_now(key, token, ttl)
    }

    fn delete_if_owner(&self, key: &str, token: &[u8]) -> CacheResult<bool> {
        self.delete_if_owner_now(key, token)
    }

    fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.ttl_now(key)
    }
}

#[async_trait]
impl AsyncKvClient for LoopbackKv {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.get_now(key)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        self.set_now(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.delete_now(key)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.set_if_absent_now(key, value, ttl)
    }

    async fn extend_if_owner(&self, key: &str, token: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.extend_if_owner_now(key, token, ttl)
    }

    async fn delete_if_owner(&self, key: &str, token: &[u8]) -> CacheResult<bool> {
        self.delete_if_owner_now(key, token)
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        self.ttl_now(key)
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for remote::loopback.
    use memora_common::MockClock;

    use super::*;

    fn kv() -> (LoopbackKv, MockClock) {
        let clock = MockClock::new();
        (LoopbackKv::with_clock(clock.shared()), clock)
    }

    #[test]
    fn test_values_expire() {
        let (kv, clock) = kv();
        KvClient::set(&kv, "k", b"v", Some(Duration::from_secs(2))).unwrap();

        clock.advance(Duration::from_millis(1_999));
        assert_eq!(KvClient::get(&kv, "k").unwrap().as_deref(), Some(&b"v"[..]));

        clock.advance_millis(1);
        assert_eq!(KvClient::get(&kv, "k").unwrap(), None);
    }

    #[test]
    fn test_set_if_absent_respects_live_and_expired_holders() {
        let (kv, clock) = kv();
        let ttl = Duration::from_secs(1);

        assert!(KvClient::set_if_absent(&kv, "lock", b"a", ttl).unwrap());
        assert!(!KvClient::set_if_absent(&kv, "lock", b"b", ttl).unwrap());

        clock.advance(ttl);
        assert!(KvClient::set_if_absent(&kv, "lock", b"b", ttl).unwrap());
    }

    #[test]
    fn test_owner_checks() {
        let (kv, clock) = kv();
        KvClient::set_if_absent(&kv, "lock", b"mine", Duration::from_secs(1)).unwrap();

        let five = Duration::from_secs(5);
        assert!(!KvClient::extend_if_owner(&kv, "lock", b"theirs", five).unwrap());
        assert!(KvClient::extend_if_owner(&kv, "lock", b"mine", five).unwrap());
        clock.advance(Duration::from_secs(2));
        assert_eq!(KvClient::ttl(&kv, "lock").unwrap(), Some(Duration::from_secs(3)));

        assert!(!KvClient::delete_if_owner(&kv, "lock", b"theirs").unwrap());
        assert!(KvClient::delete_if_owner(&kv, "lock", b"mine").unwrap());
        assert_eq!(KvClient::ttl(&kv, "lock").unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (kv, _clock) = kv();
        kv.set_failing(true);

        let err = AsyncKvClient::get(&kv, "k").await.unwrap_err();
        assert!(err.is_backend());

        kv.set_failing(false);
        assert!(AsyncKvClient::get(&kv, "k").await.unwrap().is_none());
        assert_eq!(kv.operations(), 2);
    }
}
