//! Networked backend
//!
//! The key/value server is reached through the [`KvClient`] and
//! [`AsyncKvClient`] ports. On top of them:
//!
//! - [`RemoteStore`]: entries serialized as JSON with a native TTL
//! - [`LeaseLock`]: distributed lease with a heartbeat while held
//! - [`RemoteConfig`]: clients plus settings, installed once per process
//!
//! Layout in the server:
//!
//! - `{prefix}:{function_id}:{digest}` holds one serialized entry
//! - `{prefix}:lock:{function_id}:{digest}` holds a lease token

pub mod client;
pub mod config;
pub mod lease;
pub mod loopback;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use client::{AsyncKvClient, KvClient};
pub use config::{
    remote_config, reset_remote_config, setup_remote_config, ConfigSource, RemoteConfig,
};
pub use lease::{LeaseLock, LockLease};
pub use loopback::LoopbackKv;
#[cfg(feature = "redis")]
pub use self::redis::RedisKv;
pub use store::RemoteStore;
