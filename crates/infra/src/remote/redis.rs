//! Redis adapter for the key/value ports
//!
//! Blocking calls share one lazily opened connection, reopened after an I/O
//! failure. Async calls share a multiplexed connection. Owner-checked
//! extension and deletion run as Lua scripts so the check and the write are
//! atomic on the server.

use std::time::Duration;

use async_trait::async_trait;
use memora_domain::{CacheError, CacheResult};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, Connection, RedisError, RedisResult, Script};
use tokio::sync::OnceCell;

use super::client::{AsyncKvClient, KvClient};

const EXTEND_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn backend(error: RedisError) -> CacheError {
    CacheError::Backend(format!("redis: {error}"))
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn set_cmd(key: &str, value: &[u8], ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(millis(ttl));
    }
    cmd
}

fn set_nx_cmd(key: &str, value: &[u8], ttl: Duration) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));
    cmd
}

/// `PTTL` reply: -2 for a missing key, -1 for a key without expiry
fn remaining(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

/// Key/value client talking to a Redis server
pub struct RedisKv {
    client: Client,
    sync_conn: Mutex<Option<Connection>>,
    async_conn: OnceCell<MultiplexedConnection>,
    extend_script: Script,
    delete_script: Script,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").field("connection", &self.client.get_connection_info()).finish()
    }
}

impl RedisKv {
    /// Client for `url` (`redis://host:port/db`); connects on first use
    pub fn open(url: &str) -> CacheResult<Self> {
        let client = Client::open(url).map_err(|e| {
            CacheError::Configuration(format!("invalid redis url '{url}': {e}"))
        })?;
        Ok(Self {
            client,
            sync_conn: Mutex::new(None),
            async_conn: OnceCell::new(),
            extend_script: Script::new(EXTEND_IF_OWNER),
            delete_script: Script::new(DELETE_IF_OWNER),
        })
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> RedisResult<T>) -> CacheResult<T> {
        let mut slot = self.sync_conn.lock();
        if slot.is_none() {
            *slot = Some(self.client.get_connection().map_err(backend)?);
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| CacheError::Backend("redis connection unavailable".into()))?;
        op(conn).map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() {
                *slot = None;
            }
            backend(e)
        })
    }

    async fn async_conn(&self) -> CacheResult<MultiplexedConnection> {
        self.async_conn
            .get_or_try_init(|| async {
                self.client.get_multiplexed_async_connection().await.map_err(backend)
            })
            .await
            .cloned()
    }
}

impl KvClient for RedisKv {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.with_conn(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        self.with_conn(|conn| set_cmd(key, value, ttl).query(conn))
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.with_conn(|conn| redis::cmd("DEL").arg(key).query::<i64>(conn)).map(|_| ())
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let reply: Option<String> = self.with_conn(|conn| set_nx_cmd(key, value, ttl).query(conn))?;
        Ok(reply.is_some())
    }

    fn extend_if_owner(&self, key: &str, token: &[u8], ttl: Duration) -> CacheResult<bool> {
        let extended: i64 = self.with_conn(|conn| {
            self.extend_script.key(key).arg(token).arg(millis(ttl)).invoke(conn)
        })?;
        Ok(extended == 1)
    }

    fn delete_if_owner(&self, key: &str, token: &[u8]) -> CacheResult<bool> {
        let deleted: i64 =
            self.with_conn(|conn| self.delete_script.key(key).arg(token).invoke(conn))?;
        Ok(deleted == 1)
    }

    fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let pttl: i64 = self.with_conn(|conn| redis::cmd("PTTL").arg(key).query(conn))?;
        Ok(remaining(pttl))
    }
}

#[async_trait]
impl AsyncKvClient for RedisKv {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.async_conn().await?;
        redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.async_conn().await?;
        set_cmd(key, value, ttl).query_async(&mut conn).await.map_err(backend)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.async_conn().await?;
        let _deleted: i64 =
            redis::cmd("DEL").arg(key).query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.async_conn().await?;
        let reply: Option<String> =
            set_nx_cmd(key, value, ttl).query_async(&mut conn).await.map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn extend_if_owner(&self, key: &str, token: &[u8], ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.async_conn().await?;
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(extended == 1)
    }

    async fn delete_if_owner(&self, key: &str, token: &[u8]) -> CacheResult<bool> {
        let mut conn = self.async_conn().await?;
        let deleted: i64 = self
            .delete_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted == 1)
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.async_conn().await?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await.map_err(backend)?;
        Ok(remaining(pttl))
    }
}
