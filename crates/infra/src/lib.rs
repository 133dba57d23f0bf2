//! # Memora Infrastructure
//!
//! Backends implementing the `memora-core` ports.
//!
//! This crate contains:
//! - In-process store, keyed locks and sweeper ([`memory`])
//! - Networked store and distributed lease over a key/value server
//!   ([`remote`]), with a Redis adapter behind the `redis` feature
//! - Settings loading from files and environment ([`config`])
//! - Builders wiring a memoizer to either backend ([`facade`])
//!
//! ## Architecture
//! - Implements traits defined in `memora-core`
//! - Contains all code touching threads, sockets and the filesystem

pub mod config;
pub mod facade;
pub mod memory;
pub mod remote;

// Re-export commonly used items
pub use facade::{
    memory_cache, memory_cache_with_settings, remote_cache, remote_cache_with_settings,
};
pub use memory::{LocalLocks, MemoryStore};
#[cfg(feature = "redis")]
pub use remote::RedisKv;
pub use remote::{
    remote_config, reset_remote_config, setup_remote_config, AsyncKvClient, KvClient, LeaseLock,
    LoopbackKv, RemoteConfig, RemoteStore,
};
