//! Key/value server ports
//!
//! Only the handful of primitives the store and the lease need. Every
//! failure is reported as [`memora_domain::CacheError::Backend`].

use std::time::Duration;

use async_trait::async_trait;
use memora_domain::CacheResult;

/// Blocking access to the key/value server
pub trait KvClient: Send + Sync {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Write `value`, expiring after `ttl` when given
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    fn delete(&self, key: &str) -> CacheResult<()>;

    /// Write only if `key` does not exist; `true` when written
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Reset the expiry of `key` to `ttl` if it still holds `token`
    fn extend_if_owner(&self, key: &str, token: &[u8], ttl: Duration) -> CacheResult<bool>;

    /// Delete `key` if it still holds `token`
    fn delete_if_owner(&self, key: &str, token: &[u8]) -> CacheResult<bool>;

    /// Remaining lifetime; `None` when missing or without expiry
    fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;
}

/// Async access to the key/value server
///
/// Same contract as [`KvClient`], without blocking a runtime worker.
#[async_trait]
pub trait AsyncKvClient: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool>;

    async fn extend_if_owner(&self, key: &str, token: &[u8], ttl: Duration) -> CacheResult<bool>;

    async fn delete_if_owner(&self, key: &str, token: &[u8]) -> CacheResult<bool>;

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;
}
