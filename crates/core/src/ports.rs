//! Ports implemented by storage and locking backends
//!
//! The memoizer only ever talks to these traits, so backends can be swapped
//! or mocked without touching the lookup pipeline.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use memora_domain::{CacheKey, CacheResult};

/// Key/value storage for memoized results
///
/// The blocking and `*_async` forms must behave identically. `ttl = None`
/// stores an entry that never expires at this layer.
#[async_trait]
pub trait Store<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Fresh value for `key`, or `None` when absent or expired
    fn get(&self, key: &CacheKey) -> CacheResult<Option<V>>;

    fn set(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> CacheResult<()>;

    /// `true` when no fresh value is stored under `key`
    fn is_expired(&self, key: &CacheKey) -> CacheResult<bool>;

    fn remove(&self, key: &CacheKey) -> CacheResult<()>;

    async fn get_async(&self, key: &CacheKey) -> CacheResult<Option<V>>;

    async fn set_async(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> CacheResult<()>;

    async fn is_expired_async(&self, key: &CacheKey) -> CacheResult<bool>;

    async fn remove_async(&self, key: &CacheKey) -> CacheResult<()>;
}

/// Mutual exclusion scoped to one cache key
///
/// Blocking and suspending acquisitions may use independent pools; only
/// callers of the same style are guaranteed to exclude each other.
#[async_trait]
pub trait KeyedLock: Send + Sync {
    /// Block the current thread until the lock for `key` is held
    fn acquire_blocking(&self, key: &CacheKey) -> CacheResult<LockGuard>;

    /// Suspend until the lock for `key` is held
    ///
    /// Dropping the future before it resolves leaves nothing held.
    async fn acquire(&self, key: &CacheKey) -> CacheResult<LockGuard>;
}

/// Proof of holding a keyed lock; dropping it releases the lock
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    /// Wrap whatever value releases the lock when dropped
    pub fn new<G: Send + 'static>(held: G) -> Self {
        Self { _held: Box::new(held) }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Run `body` while holding the lock for `key`
pub fn with_lock_blocking<T>(
    lock: &dyn KeyedLock,
    key: &CacheKey,
    body: impl FnOnce() -> T,
) -> CacheResult<T> {
    let _guard = lock.acquire_blocking(key)?;
    Ok(body())
}

/// Await `body` while holding the lock for `key`
///
/// The guard lives inside the returned future, so cancelling the future
/// also releases the lock.
pub async fn with_lock<T, Fut>(
    lock: &dyn KeyedLock,
    key: &CacheKey,
    body: impl FnOnce() -> Fut,
) -> CacheResult<T>
where
    Fut: Future<Output = T>,
{
    let _guard = lock.acquire(key).await?;
    Ok(body().await)
}

#[cfg(test)]
mod tests {
    //! Unit tests for ports.
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Counts live guards
    #[derive(Default)]
    struct CountingLock {
        held: Arc<AtomicUsize>,
    }

    struct Release(Arc<AtomicUsize>);

    impl Drop for Release {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KeyedLock for CountingLock {
        fn acquire_blocking(&self, _key: &CacheKey) -> CacheResult<LockGuard> {
            self.held.fetch_add(1, Ordering::SeqCst);
            Ok(LockGuard::new(Release(Arc::clone(&self.held))))
        }

        async fn acquire(&self, key: &CacheKey) -> CacheResult<LockGuard> {
            self.acquire_blocking(key)
        }
    }

    #[test]
    fn test_with_lock_blocking_holds_during_body() {
        let lock = CountingLock::default();
        let key = CacheKey::new("f", "00");

        let inside = with_lock_blocking(&lock, &key, || lock.held.load(Ordering::SeqCst)).unwrap();

        assert_eq!(inside, 1);
        assert_eq!(lock.held.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_cancellation() {
        let lock = CountingLock::default();
        let key = CacheKey::new("f", "00");

        let body = with_lock(&lock, &key, || std::future::pending::<()>());
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), body).await.is_err();

        assert!(timed_out);
        assert_eq!(lock.held.load(Ordering::SeqCst), 0);
    }
}
