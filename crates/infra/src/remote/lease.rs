//! Distributed lease lock
//!
//! A lease is a key `{prefix}:lock:{function_id}:{digest}` holding a random
//! token, written with `set_if_absent` and a native expiry equal to the lock
//! timeout. Acquisition polls with capped exponential backoff and has no
//! overall deadline: it waits until the holder releases or its lease lapses.
//!
//! While held, a heartbeat renews the expiry every `timeout / 2` so a body
//! running longer than the timeout keeps the lease. The heartbeat is a named
//! thread for blocking callers and a tokio task for async callers. Dropping
//! the guard stops the heartbeat and deletes the key if it still holds our
//! token. Release failures are logged and swallowed.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use memora_common::Backoff;
use memora_core::{KeyedLock, LockGuard};
use memora_domain::constants::{LOCK_POLL_MAX_MS, LOCK_POLL_MIN_MS};
use memora_domain::{CacheError, CacheKey, CacheResult, OnError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::client::{AsyncKvClient, KvClient};
use super::config::{ConfigSource, RemoteConfig};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// One held lease
#[derive(Debug, Clone)]
pub struct LockLease {
    lock_key: String,
    token: String,
    timeout: Duration,
    held_since: Instant,
}

impl LockLease {
    fn new(lock_key: String, timeout: Duration, held_since: Instant) -> Self {
        Self { lock_key, token: Uuid::new_v4().to_string(), timeout, held_since }
    }

    /// Server key the lease is held under
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Owner token written under the lock key
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lifetime granted by each write or extension
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the lease was acquired
    pub fn held_since(&self) -> Instant {
        self.held_since
    }

    /// Renewal period; half the timeout
    pub fn heartbeat_interval(&self) -> Duration {
        (self.timeout / 2).max(MIN_HEARTBEAT_INTERVAL)
    }
}

/// [`KeyedLock`] backed by leases in the key/value server
#[derive(Debug, Clone)]
pub struct LeaseLock {
    source: ConfigSource,
}

impl LeaseLock {
    /// Lock using whatever configuration is installed when it is called
    pub fn global() -> Self {
        Self { source: ConfigSource::Global }
    }

    /// Lease lock bound to `config` instead of the global one
    pub fn with_config(config: Arc<RemoteConfig>) -> Self {
        Self { source: ConfigSource::Fixed(config) }
    }
}

fn poll_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(LOCK_POLL_MIN_MS), Duration::from_millis(LOCK_POLL_MAX_MS))
}

/// Backend failure while acquiring: raise, or run the body unlocked
fn unlocked(config: &RemoteConfig, key: &CacheKey, error: CacheError) -> CacheResult<LockGuard> {
    match config.settings().on_error {
        OnError::Raise => Err(error),
        OnError::Silent => {
            debug!(
                function_id = key.function_id(),
                digest = key.digest(),
                error = %error,
                "lease.backend_error"
            );
            Ok(LockGuard::new(()))
        }
    }
}

#[async_trait]
impl KeyedLock for LeaseLock {
    fn acquire_blocking(&self, key: &CacheKey) -> CacheResult<LockGuard> {
        let config = self.source.resolve()?;
        let client = Arc::clone(config.sync_client()?);
        let lease = LockLease::new(
            config.lock_key(key),
            config.settings().lock_timeout(),
            config.clock().now(),
        );

        let mut backoff = poll_backoff();
        loop {
            match client.set_if_absent(&lease.lock_key, lease.token.as_bytes(), lease.timeout) {
                Ok(true) => break,
                Ok(false) => std::thread::sleep(backoff.next_delay()),
                Err(e) => return unlocked(&config, key, e),
            }
        }

        let lease = LockLease { held_since: config.clock().now(), ..lease };
        debug!(lock_key = %lease.lock_key, polls = backoff.attempts(), "lease.acquired");
        Ok(LockGuard::new(BlockingLease::start(lease, client)))
    }

    async fn acquire(&self, key: &CacheKey) -> CacheResult<LockGuard> {
        let config = self.source.resolve()?;
        let client = Arc::clone(config.async_client()?);
        let lease = LockLease::new(
            config.lock_key(key),
            config.settings().lock_timeout(),
            config.clock().now(),
        );

        let mut backoff = poll_backoff();
        loop {
            let attempt =
                client.set_if_absent(&lease.lock_key, lease.token.as_bytes(), lease.timeout).await;
            match attempt {
                Ok(true) => break,
                Ok(false) => tokio::time::sleep(backoff.next_delay()).await,
                Err(e) => return unlocked(&config, key, e),
            }
        }

        let lease = LockLease { held_since: config.clock().now(), ..lease };
        debug!(lock_key = %lease.lock_key, polls = backoff.attempts(), "lease.acquired");
        Ok(LockGuard::new(AsyncLease::start(lease, client)))
    }
}

/// Lease held by a blocking caller; the heartbeat runs on its own thread
struct BlockingLease {
    lease: LockLease,
    client: Arc<dyn KvClient>,
    stop: Option<mpsc::Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl BlockingLease {
    fn start(lease: LockLease, client: Arc<dyn KvClient>) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let worker_lease = lease.clone();
        let worker_client = Arc::clone(&client);

        let heartbeat = std::thread::Builder::new()
            .name("memora-lease-heartbeat".into())
            .spawn(move || blocking_heartbeat(&worker_lease, worker_client.as_ref(), &stopped));

        let heartbeat = match heartbeat {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(lock_key = %lease.lock_key, error = %e, "lease.heartbeat_spawn_failed");
                None
            }
        };

        Self { lease, client, stop: Some(stop), heartbeat }
    }
}

fn blocking_heartbeat(lease: &LockLease, client: &dyn KvClient, stopped: &mpsc::Receiver<()>) {
    let interval = lease.heartbeat_interval();
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        match client.extend_if_owner(&lease.lock_key, lease.token.as_bytes(), lease.timeout) {
            Ok(true) => trace!(lock_key = %lease.lock_key, "lease.heartbeat"),
            Ok(false) => {
                warn!(lock_key = %lease.lock_key, "lease.heartbeat_lost");
                return;
            }
            Err(e) => warn!(lock_key = %lease.lock_key, error = %e, "lease.heartbeat_failed"),
        }
    }
}

impl Drop for BlockingLease {
    fn drop(&mut self) {
        // Closing the channel wakes the heartbeat; joining guarantees no
        // extension lands after the delete below.
        drop(self.stop.take());
        if let Some(handle) = self.heartbeat.take() {
            if handle.join().is_err() {
                warn!(lock_key = %self.lease.lock_key, "lease.heartbeat_panicked");
            }
        }
        match self.client.delete_if_owner(&self.lease.lock_key, self.lease.token.as_bytes()) {
            Ok(released) => debug!(lock_key = %self.lease.lock_key, released, "lease.released"),
            Err(e) => debug!(lock_key = %self.lease.lock_key, error = %e, "lease.release_failed"),
        }
    }
}

/// Lease held by an async caller; a task heartbeats and then releases
struct AsyncLease {
    cancel: CancellationToken,
}

impl AsyncLease {
    fn start(lease: LockLease, client: Arc<dyn AsyncKvClient>) -> Self {
        let cancel = CancellationToken::new();
        tokio::spawn(async_heartbeat(lease, client, cancel.clone()));
        Self { cancel }
    }
}

async fn async_heartbeat(
    lease: LockLease,
    client: Arc<dyn AsyncKvClient>,
    cancel: CancellationToken,
) {
    let interval = lease.heartbeat_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match client.extend_if_owner(&lease.lock_key, lease.token.as_bytes(), lease.timeout).await {
            Ok(true) => trace!(lock_key = %lease.lock_key, "lease.heartbeat"),
            Ok(false) => {
                warn!(lock_key = %lease.lock_key, "lease.heartbeat_lost");
                return;
            }
            Err(e) => warn!(lock_key = %lease.lock_key, error = %e, "lease.heartbeat_failed"),
        }
    }

    match client.delete_if_owner(&lease.lock_key, lease.token.as_bytes()).await {
        Ok(released) => debug!(lock_key = %lease.lock_key, released, "lease.released"),
        Err(e) => debug!(lock_key = %lease.lock_key, error = %e, "lease.release_failed"),
    }
}

impl Drop for AsyncLease {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
